use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};

use livedet::stream::client::MjpegReader;
use livedet::{Frame, PublishedFrame, StreamBroadcaster, StreamConfig, StreamHandle};

const TIMEOUT: Duration = Duration::from_secs(5);

fn start(frames: &Arc<PublishedFrame>) -> StreamHandle {
    let cfg = StreamConfig {
        addr: "127.0.0.1:0".to_string(),
        poll_interval: Duration::from_millis(5),
        keepalive_interval: Duration::from_millis(100),
        write_timeout: Duration::from_secs(2),
        ..StreamConfig::default()
    };
    StreamBroadcaster::new(cfg, frames.clone())
        .start()
        .expect("start broadcaster")
}

fn frame(index: u64, shade: u8) -> Frame {
    Frame::new(index, 0, RgbImage::from_pixel(32, 16, Rgb([shade, shade, shade])))
}

fn connect(handle: &StreamHandle) -> MjpegReader<TcpStream> {
    MjpegReader::connect(&handle.addr.to_string(), TIMEOUT).expect("connect to stream")
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn writes_exact_multipart_header() {
    let frames = Arc::new(PublishedFrame::default());
    let handle = start(&frames);

    let mut stream = TcpStream::connect(handle.addr).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n").unwrap();

    let expected = "HTTP/1.0 200 OK\r\n\
        Connection: close\r\n\
        Max-Age: 0\r\n\
        Expires: 0\r\n\
        Cache-Control: no-store, no-cache, must-revalidate, pre-check=0, post-check=0, max-age=0\r\n\
        Pragma: no-cache\r\n\
        Content-Type: multipart/x-mixed-replace; boundary=stream\r\n\
        \r\n\
        --stream\r\n";
    let mut received = vec![0u8; expected.len()];
    stream.read_exact(&mut received).unwrap();
    assert_eq!(String::from_utf8(received).unwrap(), expected);

    drop(stream);
    handle.stop().unwrap();
}

#[test]
fn streams_published_frames_as_jpeg_parts() {
    let frames = Arc::new(PublishedFrame::default());
    let handle = start(&frames);
    let mut reader = connect(&handle);
    assert_eq!(reader.boundary(), "stream");

    frames.publish(frame(0, 200));
    let part = reader.next_part().unwrap().expect("first part");
    let decoded = image::load_from_memory(&part).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (32, 16));

    // Without a new frame the current one is re-sent as keep-alive.
    let again = reader.next_part().unwrap().expect("keep-alive part");
    assert_eq!(again, part);

    drop(reader);
    handle.stop().unwrap();
}

#[test]
fn dropping_one_client_leaves_the_other_streaming() {
    let frames = Arc::new(PublishedFrame::default());
    let handle = start(&frames);

    let mut a = connect(&handle);
    let mut b = connect(&handle);
    assert!(wait_for(|| handle.active_clients() == 2));

    frames.publish(frame(0, 10));
    assert!(a.next_part().unwrap().is_some());
    assert!(b.next_part().unwrap().is_some());

    drop(a);
    let mut shade = 20u8;
    let gone = wait_for(|| {
        shade = shade.wrapping_add(10);
        frames.publish(frame(u64::from(shade), shade));
        handle.active_clients() == 1
    });
    assert!(gone, "worker for the dropped client never exited");

    for _ in 0..3 {
        frames.publish(frame(99, 99));
        let part = b.next_part().unwrap().expect("b keeps streaming");
        assert!(image::load_from_memory(&part).is_ok());
    }

    drop(b);
    handle.stop().unwrap();
}

#[test]
fn stop_closes_listener_but_not_connected_clients() {
    let frames = Arc::new(PublishedFrame::default());
    let handle = start(&frames);
    let addr = handle.addr;
    let mut reader = connect(&handle);

    frames.publish(frame(0, 50));
    assert!(reader.next_part().unwrap().is_some());

    handle.stop().unwrap();
    assert!(TcpStream::connect(addr).is_err(), "listener still open");

    frames.publish(frame(1, 60));
    assert!(reader.next_part().unwrap().is_some());
}

#[test]
fn clients_that_send_no_request_still_get_the_stream() {
    let frames = Arc::new(PublishedFrame::default());
    frames.publish(frame(0, 70));
    let handle = start(&frames);

    let stream = TcpStream::connect(handle.addr).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut reader = MjpegReader::new(stream).unwrap();
    assert!(reader.next_part().unwrap().is_some());

    drop(reader);
    handle.stop().unwrap();
}

#[test]
fn clients_leaving_before_the_first_frame_are_released() {
    let frames = Arc::new(PublishedFrame::default());
    let handle = start(&frames);

    let clients: Vec<TcpStream> = (0..3)
        .map(|_| {
            let mut stream = TcpStream::connect(handle.addr).unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
            stream
        })
        .collect();
    assert!(wait_for(|| handle.active_clients() == 3));

    drop(clients);
    assert!(
        wait_for(|| handle.active_clients() == 0),
        "workers outlived their clients: {} still registered",
        handle.active_clients()
    );
    assert_eq!(frames.generation(), 0);

    handle.stop().unwrap();
}
