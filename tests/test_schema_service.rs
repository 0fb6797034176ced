use anyhow::{bail, Result};
use explorer_cli::schema_cache::{Schema, SchemaService, SchemaSource};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Answers after a per-connection delay so completions can be reordered.
struct SlowSource {
    calls: AtomicUsize,
}

impl SlowSource {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

impl SchemaSource for SlowSource {
    fn fetch_schema(&self, connection: &str) -> Result<Schema> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = match connection {
            "slow" => 300,
            "fast" => 10,
            "broken" => bail!("HTTP error! Status: 500 Internal Server Error"),
            _ => 0,
        };
        thread::sleep(Duration::from_millis(delay));
        Schema::from_json(&format!(r#"{{"{}_table": ["id"]}}"#, connection))
    }
}

#[test]
fn test_one_fetch_per_connection() {
    let service = SchemaService::new(SlowSource::new());
    for _ in 0..5 {
        let schema = service.get("main").unwrap();
        assert!(schema.contains("main_table"));
    }
    assert_eq!(service.source().calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failed_fetch_is_retried() {
    let service = SchemaService::new(SlowSource::new());
    assert!(service.get("broken").is_err());
    assert!(service.get("broken").is_err());
    assert_eq!(service.source().calls.load(Ordering::SeqCst), 2);
    assert!(service.cache().cached("broken").is_none());
}

#[test]
fn test_rapid_switch_keeps_latest_connection_active() {
    let service = Arc::new(SchemaService::new(SlowSource::new()));

    let first = {
        let service = Arc::clone(&service);
        thread::spawn(move || service.get("slow").map(|s| s.len()))
    };
    thread::sleep(Duration::from_millis(50));
    let second = {
        let service = Arc::clone(&service);
        thread::spawn(move || service.get("fast").map(|s| s.len()))
    };

    assert_eq!(second.join().unwrap().unwrap(), 1);
    assert_eq!(first.join().unwrap().unwrap(), 1);

    let (active, schema) = service.cache().active().unwrap();
    assert_eq!(active, "fast");
    assert!(schema.contains("fast_table"));

    // Both responses landed under their own keys
    assert!(service.cache().cached("slow").unwrap().contains("slow_table"));
    assert!(service.cache().cached("fast").unwrap().contains("fast_table"));
}

#[test]
fn test_switching_back_uses_cache() {
    let service = SchemaService::new(SlowSource::new());
    service.get("a").unwrap();
    service.get("b").unwrap();
    service.get("a").unwrap();
    assert_eq!(service.source().calls.load(Ordering::SeqCst), 2);
    assert_eq!(service.cache().active().unwrap().0, "a");
}
