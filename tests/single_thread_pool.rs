//! Liveness on a single-worker Rayon pool.
//!
//! The batch driver keeps its bookkeeping loop on the calling thread, so
//! even a one-thread global pool has a free worker for the dispatched
//! tasks. This file pins the global pool to one thread, which is why it
//! holds a single test in its own binary.

use std::sync::mpsc::channel;
use std::time::Duration;

use kumiki::Batch;

#[test]
fn test_batch_settles_on_a_one_thread_pool() {
    rayon::ThreadPoolBuilder::new()
        .num_threads(1)
        .build_global()
        .unwrap();

    // Drive the batch from a helper thread so a scheduling regression
    // shows up as a timeout instead of hanging the test run.
    let (done, settled) = channel();
    std::thread::spawn(move || {
        let mut batch = Batch::<()>::new();
        let net = batch.define("net").create_with(|_| Ok(String::from("n")));
        let vm_a = batch
            .define("vm-a")
            .requires(net.clone())
            .create_with(|_, net| Ok(format!("a@{net}")));
        let vm_b = batch
            .define("vm-b")
            .requires(net.clone())
            .create_with(|_, net| Ok(format!("b@{net}")));

        let created = batch.create(&[vm_a.clone(), vm_b.clone()], ()).unwrap();
        let first = created.get(vm_a.key()).cloned();
        let second = created.get(vm_b.key()).cloned();
        done.send((first, second)).unwrap();
    });

    let (first, second) = settled
        .recv_timeout(Duration::from_secs(60))
        .expect("batch did not settle on a one-thread pool");

    assert_eq!(first.as_deref(), Some("a@n"));
    assert_eq!(second.as_deref(), Some("b@n"));
}
