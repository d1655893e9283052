//! Module teardown drains the configured-name list.

use bdev::MemBdev;
use passthru::{create_disk, delete_disk, finish, PassthruConfig};

#[test]
fn finish_forgets_deferred_names() {
    // A name waiting for its base...
    create_disk(PassthruConfig::new("td-base", "td-pt")).unwrap();

    // ...is gone after teardown, so the arriving base attaches nothing.
    finish();
    let mem = MemBdev::create("td-base", 512, 4096).unwrap();
    assert!(bdev::registry::get("td-pt").is_none());

    // And the name is free to configure again.
    create_disk(PassthruConfig::new("td-base", "td-pt")).unwrap();
    assert!(bdev::registry::get("td-pt").is_some());
    delete_disk("td-pt", |r| r.unwrap());
    mem.destroy();
}
