use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::{HostStream, PlatformId, Stream};

#[test]
fn test_idle_stream_does_not_block() {
    let stream = HostStream::new(PlatformId::HOST, 0);
    stream.block_host_until_done(10).unwrap();
}

#[test]
fn test_submit_returns_increasing_tickets() {
    let stream = HostStream::new(PlatformId::HOST, 0);
    assert_eq!(stream.submit(), 1);
    assert_eq!(stream.submit(), 2);
    assert_eq!(stream.submitted(), 2);
}

#[test]
fn test_block_until_completed_from_other_thread() {
    let stream = Arc::new(HostStream::new(PlatformId::CUDA, 0));
    let ticket = stream.submit();

    let worker = {
        let stream = Arc::clone(&stream);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stream.complete(ticket);
        })
    };

    stream.block_host_until_done(0).unwrap();
    worker.join().unwrap();
}

#[test]
fn test_block_times_out() {
    let stream = HostStream::new(PlatformId::HOST, 0);
    stream.submit();
    let err = stream.block_host_until_done(10).unwrap_err();
    assert!(err.to_string().contains("timed out"));
}
