use container_backend::iodaemon::handoff::receive_fds;
use container_backend::iodaemon::{Broker, Link, listen};
use container_backend::ProcessSpec;
use nix::sys::stat::fstat;
use std::fs;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use tempfile::TempDir;

fn sh(script: &str) -> ProcessSpec {
    ProcessSpec::new("sh", vec!["-c".into(), script.into()])
}

/// Start a broker for `spec` in the background and return its socket path.
fn serve(dir: &Path, spec: ProcessSpec) -> PathBuf {
    let socket = dir.join("run/iodaemon.sock");
    let listener = listen(&socket).unwrap();
    let broker = Broker::new(listener, &spec).unwrap();
    thread::spawn(move || broker.serve());
    socket
}

fn read_all(mut from: impl Read) -> String {
    let mut out = Vec::new();
    // A tty master ends with EIO rather than EOF.
    let _ = from.read_to_end(&mut out);
    String::from_utf8_lossy(&out).into_owned()
}

#[test]
fn test_concurrent_clients_share_one_process() {
    let tmp = TempDir::new().unwrap();
    let marker = tmp.path().join("starts");
    let socket = serve(
        tmp.path(),
        sh(&format!("echo started >> {}; cat", marker.display())),
    );

    let attaching: Vec<_> = (0..5)
        .map(|_| {
            let socket = socket.clone();
            thread::spawn(move || Link::attach(&socket).unwrap())
        })
        .collect();
    let mut links: Vec<Link> = attaching.into_iter().map(|t| t.join().unwrap()).collect();

    let inode = |link: &Link| fstat(link.stdout.as_raw_fd()).unwrap().st_ino;
    let first = inode(&links[0]);
    assert!(links.iter().all(|link| inode(link) == first));

    links[3].send(b"echoed back\n").unwrap();
    links[3].close_input().unwrap();

    let stdout = links[0].stdout.try_clone().unwrap();
    assert_eq!(read_all(stdout), "echoed back\n");
    assert_eq!(links[1].exit_status().unwrap(), 0);

    assert_eq!(fs::read_to_string(&marker).unwrap(), "started\n");
}

#[test]
fn test_exit_code_reaches_client() {
    let tmp = TempDir::new().unwrap();
    let socket = serve(tmp.path(), sh("read word; echo \"$word\" >&2; exit 12"));

    let mut link = Link::attach(&socket).unwrap();
    link.send(b"to-stderr\n").unwrap();

    assert_eq!(link.exit_status().unwrap(), 12);
    let stderr = link.stderr.try_clone().unwrap();
    assert_eq!(read_all(stderr), "to-stderr\n");
}

#[test]
fn test_killed_process_reports_unknown_status() {
    let tmp = TempDir::new().unwrap();
    let socket = serve(tmp.path(), sh("kill -9 $$"));

    let mut link = Link::attach(&socket).unwrap();
    assert_eq!(link.exit_status().unwrap(), 255);
}

#[test]
fn test_input_split_across_clients() {
    let tmp = TempDir::new().unwrap();
    let socket = serve(tmp.path(), ProcessSpec::new("cat", vec![]));

    let mut a = Link::attach(&socket).unwrap();
    let mut b = Link::attach(&socket).unwrap();
    let mut stdout = b.stdout.try_clone().unwrap();

    // Each chunk must come back out of cat before the other client writes.
    let mut echoed = [0u8; 4];
    a.send(b"one ").unwrap();
    stdout.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"one ");

    b.send(b"two\n").unwrap();
    stdout.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"two\n");

    a.close_input().unwrap();
    assert_eq!(read_all(stdout), "");
    assert_eq!(b.exit_status().unwrap(), 0);
}

#[test]
fn test_broken_clients_do_not_disturb_others() {
    let tmp = TempDir::new().unwrap();
    let socket = serve(tmp.path(), ProcessSpec::new("cat", vec![]));

    // Hangs up before the handoff.
    drop(UnixStream::connect(&socket).unwrap());

    // Takes the descriptors, then talks nonsense.
    let mut rude = UnixStream::connect(&socket).unwrap();
    assert_eq!(receive_fds(&rude).unwrap().len(), 3);
    rude.write_all(b"this is not a frame").unwrap();
    drop(rude);

    let mut link = Link::attach(&socket).unwrap();
    link.send(b"still here\n").unwrap();
    link.close_input().unwrap();

    let stdout = link.stdout.try_clone().unwrap();
    assert_eq!(read_all(stdout), "still here\n");
    assert_eq!(link.exit_status().unwrap(), 0);
}

#[test]
fn test_tty_process_sees_a_terminal() {
    let tmp = TempDir::new().unwrap();
    let spec = sh("if test -t 0 && test -t 1; then echo on-a-tty; fi").with_tty(true);
    let socket = serve(tmp.path(), spec);

    let mut link = Link::attach(&socket).unwrap();
    assert_eq!(link.exit_status().unwrap(), 0);

    let stdout = link.stdout.try_clone().unwrap();
    assert!(read_all(stdout).contains("on-a-tty"));
}
