use std::collections::HashSet;

use spool::{Error, PublishedMessage, Qos, QueueRepository, Record, RepositoryConfig};
use tempfile::tempdir;

fn publish(payload: &str) -> Record {
    Record::Published(PublishedMessage::new("t", Qos::AtMostOnce, payload))
}

#[test]
fn queues_are_isolated_per_client() {
    let dir = tempdir().expect("tempdir");
    let repo = QueueRepository::open(RepositoryConfig::segmented(dir.path())).expect("repo");
    let c1 = repo.get_or_create_queue("c1").expect("c1");
    let c2 = repo.get_or_create_queue("c2").expect("c2");

    c1.enqueue(publish("for c1")).expect("enqueue c1");
    assert!(c2.is_empty());
    assert_eq!(c2.dequeue().expect("dequeue c2"), None);
    assert_eq!(c1.dequeue().expect("dequeue c1"), Some(publish("for c1")));
}

#[test]
fn dropped_queue_is_recreated_empty() {
    let dir = tempdir().expect("tempdir");
    let repo = QueueRepository::open(RepositoryConfig::segmented(dir.path())).expect("repo");
    let old = repo.get_or_create_queue("c1").expect("queue");
    old.enqueue(publish("stale")).expect("enqueue");

    assert!(repo.drop_queue("c1").expect("drop"));
    assert!(!repo.contains_queue("c1").expect("contains"));
    assert!(matches!(old.enqueue(publish("late")), Err(Error::QueueDropped)));

    let fresh = repo.get_or_create_queue("c1").expect("recreate");
    assert!(fresh.is_empty());
    assert_eq!(fresh.dequeue().expect("dequeue"), None);
}

#[test]
fn persisted_queues_are_listed_after_restart() {
    let dir = tempdir().expect("tempdir");
    {
        let repo = QueueRepository::open(RepositoryConfig::segmented(dir.path())).expect("repo");
        for name in ["alpha", "beta/1", "gamma"] {
            repo.get_or_create_queue(name)
                .expect("queue")
                .enqueue(publish(name))
                .expect("enqueue");
        }
        repo.drop_queue("gamma").expect("drop");
    }

    let repo = QueueRepository::open(RepositoryConfig::segmented(dir.path())).expect("reopen");
    let expected: HashSet<String> = ["alpha", "beta/1"].iter().map(|s| s.to_string()).collect();
    assert_eq!(repo.list_queue_names().expect("list"), expected);
    let beta = repo.get_or_create_queue("beta/1").expect("beta");
    assert_eq!(beta.dequeue().expect("dequeue"), Some(publish("beta/1")));
}

#[test]
fn data_directory_admits_one_repository() {
    let dir = tempdir().expect("tempdir");
    let first = QueueRepository::open(RepositoryConfig::segmented(dir.path())).expect("first");
    assert!(matches!(
        QueueRepository::open(RepositoryConfig::segmented(dir.path())),
        Err(Error::DirectoryLocked)
    ));
    drop(first);
    QueueRepository::open(RepositoryConfig::segmented(dir.path())).expect("after release");
}

#[test]
fn memory_queues_do_not_outlive_repository() {
    let repo = QueueRepository::open(RepositoryConfig::memory()).expect("repo");
    repo.get_or_create_queue("c1").expect("queue").enqueue(publish("x")).expect("enqueue");
    assert_eq!(repo.list_queue_names().expect("list").len(), 1);
    drop(repo);

    let repo = QueueRepository::open(RepositoryConfig::memory()).expect("repo");
    assert!(repo.list_queue_names().expect("list").is_empty());
}
