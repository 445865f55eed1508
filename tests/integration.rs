//! Integration tests for the kernos concurrency core
//!
//! End-to-end scenarios across process spawning, the thread lifecycle,
//! and the socket rendezvous - the paths a real workload exercises.
//! Every test boots its own kernel, so ports never collide across tests.

use kernos::kernel::thread::TaskEntry;
use kernos::kernel::{Kernel, KernelConfig, Pid, Port, ShutdownMode};
use std::sync::mpsc;
use std::time::Duration;

fn boot() -> Kernel {
    Kernel::boot(KernelConfig::default())
}

/// Read until EOF, collecting everything.
fn read_to_end(sys: &kernos::Sys, fd: kernos::kernel::Fd) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = sys.read(fd, &mut buf).unwrap();
        if n == 0 {
            return collected;
        }
        collected.extend_from_slice(&buf[..n]);
    }
}

#[test]
fn test_echo_between_unrelated_processes() {
    let kernel = boot();
    let port = Port(200);
    let (ready_tx, ready_rx) = mpsc::channel::<()>();
    let (reply_tx, reply_rx) = mpsc::channel();

    kernel.spawn_process(
        "echo-server",
        TaskEntry::new(move |sys, _| {
            let listener = sys.socket(port).unwrap();
            sys.listen(listener).unwrap();
            ready_tx.send(()).unwrap();

            let peer = sys.accept(listener).unwrap();
            let request = read_to_end(sys, peer);
            sys.write(peer, &request).unwrap();
            sys.shutdown(peer, ShutdownMode::Write).unwrap();
            0
        }),
    );
    ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    kernel.spawn_process(
        "echo-client",
        TaskEntry::new(move |sys, _| {
            let fd = sys.socket(port).unwrap();
            sys.connect(fd, port, Duration::from_secs(5)).unwrap();
            sys.write(fd, b"hello from far away").unwrap();
            sys.shutdown(fd, ShutdownMode::Write).unwrap();
            reply_tx.send(read_to_end(sys, fd)).unwrap();
            0
        }),
    );

    let reply = reply_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(reply, b"hello from far away");

    kernel.wait_child(Pid::INIT).unwrap();
    kernel.wait_child(Pid::INIT).unwrap();
    kernel.shutdown();
    assert_eq!(kernel.live_sockets(), 0);
}

#[test]
fn test_server_thread_pool_serves_many_clients() {
    let kernel = boot();
    let port = Port(201);
    let clients = 4u8;
    let (ready_tx, ready_rx) = mpsc::channel::<()>();
    let (reply_tx, reply_rx) = mpsc::channel();

    kernel.spawn_process(
        "pool-server",
        TaskEntry::new(move |sys, _| {
            let listener = sys.socket(port).unwrap();
            sys.listen(listener).unwrap();
            ready_tx.send(()).unwrap();

            // One worker thread per connection; each doubles the byte it
            // receives and sends it back.
            let mut workers = Vec::new();
            for _ in 0..clients {
                let peer = sys.accept(listener).unwrap();
                workers.push(sys.create_thread(TaskEntry::new(move |sys, _| {
                    let mut buf = [0u8; 1];
                    sys.read(peer, &mut buf).unwrap();
                    sys.write(peer, &[buf[0] * 2]).unwrap();
                    0
                })));
            }
            for worker in workers {
                sys.thread_join(worker, None).unwrap();
            }
            0
        }),
    );
    ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    for i in 1..=clients {
        let reply_tx = reply_tx.clone();
        kernel.spawn_process(
            "pool-client",
            TaskEntry::with_args(
                move |sys, args| {
                    let fd = sys.socket(port).unwrap();
                    sys.connect(fd, port, Duration::from_secs(5)).unwrap();
                    sys.write(fd, &args).unwrap();
                    let mut buf = [0u8; 1];
                    sys.read(fd, &mut buf).unwrap();
                    reply_tx.send((args[0], buf[0])).unwrap();
                    0
                },
                vec![i],
            ),
        );
    }

    for _ in 0..clients {
        let (sent, doubled) = reply_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(doubled, sent * 2);
    }
    for _ in 0..=clients {
        kernel.wait_child(Pid::INIT).unwrap();
    }
    kernel.shutdown();
    assert_eq!(kernel.live_sockets(), 0);
    assert_eq!(kernel.live_threads(), 0);
}

#[test]
fn test_worker_fanout_joins_collect_every_exit_value() {
    let kernel = boot();
    let (sum_tx, sum_rx) = mpsc::channel();

    kernel.spawn_process(
        "fanout",
        TaskEntry::new(move |sys, _| {
            let workers: Vec<_> = (1..=8)
                .map(|i| {
                    sys.create_thread(TaskEntry::with_args(
                        |_, args| args[0] as i32,
                        vec![i],
                    ))
                })
                .collect();

            let mut sum = 0;
            for worker in workers {
                let mut v = 0;
                sys.thread_join(worker, Some(&mut v)).unwrap();
                sum += v;
            }
            sum_tx.send(sum).unwrap();
            sum
        }),
    );

    assert_eq!(sum_rx.recv_timeout(Duration::from_secs(10)).unwrap(), 36);
    let (_, status) = kernel.wait_child(Pid::INIT).unwrap();
    assert_eq!(status, 36);
    kernel.shutdown();
}

#[test]
fn test_orphaned_grandchild_is_adopted_and_reaped_by_init() {
    let kernel = boot();
    let (pids_tx, pids_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    kernel.spawn_process(
        "parent",
        TaskEntry::new(move |sys, _| {
            let grandchild = sys.spawn_process(
                "grandchild",
                TaskEntry::new(move |_, _| {
                    release_rx.recv().unwrap();
                    21
                }),
            );
            pids_tx.send((sys.pid(), grandchild)).unwrap();
            // Exit while the grandchild is still alive.
            7
        }),
    );

    let (parent, grandchild) = pids_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let (reaped, status) = kernel.wait_child(Pid::INIT).unwrap();
    assert_eq!(reaped, parent);
    assert_eq!(status, 7);

    // The orphan now belongs to init.
    assert_eq!(kernel.parent_of(grandchild), Some(Pid::INIT));
    assert!(kernel.children(Pid::INIT).contains(&grandchild));

    release_tx.send(()).unwrap();
    let (reaped, status) = kernel.wait_child(Pid::INIT).unwrap();
    assert_eq!(reaped, grandchild);
    assert_eq!(status, 21);
    kernel.shutdown();
}

#[test]
fn test_exiting_server_process_fails_blocked_accept_cleanly() {
    let kernel = boot();
    let port = Port(202);
    let (ready_tx, ready_rx) = mpsc::channel::<()>();
    let (outcome_tx, outcome_rx) = mpsc::channel();

    kernel.spawn_process(
        "half-server",
        TaskEntry::new(move |sys, _| {
            let listener = sys.socket(port).unwrap();
            sys.listen(listener).unwrap();

            // The acceptor blocks; the main thread closes the listener
            // out from under it and exits.
            let acceptor = sys.create_thread(TaskEntry::new(move |sys, _| {
                match sys.accept(listener) {
                    Err(_) => 1,
                    Ok(_) => -1,
                }
            }));
            ready_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            sys.close(listener).unwrap();

            let mut saw_failure = 0;
            sys.thread_join(acceptor, Some(&mut saw_failure)).unwrap();
            outcome_tx.send(saw_failure).unwrap();
            0
        }),
    );

    ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(outcome_rx.recv_timeout(Duration::from_secs(10)).unwrap(), 1);

    // With the listener gone, a late connector is refused outright.
    let (refused_tx, refused_rx) = mpsc::channel();
    kernel.spawn_process(
        "late-client",
        TaskEntry::new(move |sys, _| {
            let fd = sys.socket(port).unwrap();
            refused_tx
                .send(sys.connect(fd, port, Duration::from_millis(100)))
                .unwrap();
            0
        }),
    );
    assert!(refused_rx
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .is_err());
    kernel.shutdown();
}
