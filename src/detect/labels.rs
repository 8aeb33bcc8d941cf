use std::collections::HashMap;

/// Class id to display name table, built once at startup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelTable {
    names: HashMap<usize, String>,
}

impl LabelTable {
    /// Class ids are assigned in list order starting at zero.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names
            .into_iter()
            .enumerate()
            .map(|(id, name)| (id, name.into()))
            .collect();
        Self { names }
    }

    /// Parse a comma-separated list such as `"person,car,dog"`.
    pub fn from_csv(value: &str) -> Self {
        Self::from_names(value.split(',').map(|name| name.trim().to_string()))
    }

    pub fn get(&self, class_id: usize) -> Option<&str> {
        self.names.get(&class_id).map(String::as_str)
    }

    /// Name to show on frames and in the prediction log.
    pub fn display(&self, class_id: usize) -> String {
        match self.get(class_id) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("class {}", class_id),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_labels_are_indexed_in_order() {
        let labels = LabelTable::from_csv("person, car,dog");
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.get(0), Some("person"));
        assert_eq!(labels.get(1), Some("car"));
        assert_eq!(labels.display(2), "dog");
    }

    #[test]
    fn unknown_class_falls_back_to_id() {
        let labels = LabelTable::from_names(["person"]);
        assert_eq!(labels.display(7), "class 7");
    }
}
