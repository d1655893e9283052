//! Control-plane and lifecycle behaviour: creation, deferred attach,
//! deletion, hot-remove, reattach, and introspection output.

use std::sync::{Arc, Mutex};

use bdev::{BdevDesc, BdevEvent, IoStatus, MemBdev, SharedBuf, SubmitError};
use passthru::{
    config_json, create_disk, delete_disk, CreateError, MetadataInit, PassthruConfig,
};

fn config(base: &str, name: &str) -> PassthruConfig {
    let mut config = PassthruConfig::new(base, name);
    config.block_size = 4096;
    config.md_size = 8;
    config.mode = MetadataInit::Zero;
    config
}

#[test]
fn duplicate_names_are_rejected() {
    let mem = MemBdev::create("lc-dup-base", 512, 65_536).unwrap();
    create_disk(config("lc-dup-base", "lc-dup-pt")).unwrap();
    assert!(matches!(
        create_disk(config("lc-dup-base", "lc-dup-pt")),
        Err(CreateError::AlreadyExists(_))
    ));
    delete_disk("lc-dup-pt", |r| r.unwrap());
    mem.destroy();
}

#[test]
fn base_claim_is_exclusive_while_attached() {
    let mem = MemBdev::create("lc-claim-base", 512, 65_536).unwrap();
    create_disk(config("lc-claim-base", "lc-claim-pt")).unwrap();

    assert_eq!(mem.bdev().claimed_by(), Some("passthru"));
    // A second virtual device over the same base cannot claim it.
    assert!(matches!(
        create_disk(config("lc-claim-base", "lc-claim-pt2")),
        Err(CreateError::Claim(_))
    ));

    delete_disk("lc-claim-pt", |r| r.unwrap());
    assert_eq!(mem.bdev().claimed_by(), None);
    mem.destroy();
}

#[test]
fn creation_defers_until_the_base_arrives() {
    create_disk(config("lc-late-base", "lc-late-pt")).unwrap();
    assert!(bdev::registry::get("lc-late-pt").is_none());

    // The base arriving triggers the deferred registration.
    let mem = MemBdev::create("lc-late-base", 512, 65_536).unwrap();
    assert!(bdev::registry::get("lc-late-pt").is_some());

    delete_disk("lc-late-pt", |r| r.unwrap());
    mem.destroy();
}

#[test]
fn delete_drops_the_name_for_good() {
    let mem = MemBdev::create("lc-del-base", 512, 65_536).unwrap();
    create_disk(config("lc-del-base", "lc-del-pt")).unwrap();
    delete_disk("lc-del-pt", |r| r.unwrap());
    assert!(bdev::registry::get("lc-del-pt").is_none());
    mem.destroy();

    // The deleted name does not come back with the base.
    let mem = MemBdev::create("lc-del-base", 512, 65_536).unwrap();
    assert!(bdev::registry::get("lc-del-pt").is_none());
    mem.destroy();
}

#[test]
fn delete_reports_unknown_names_through_the_callback() {
    let seen = Arc::new(Mutex::new(None));
    let s = seen.clone();
    delete_disk("lc-missing-pt", move |r| {
        *s.lock().unwrap() = Some(r.is_err());
    });
    assert_eq!(*seen.lock().unwrap(), Some(true));
}

#[test]
fn hot_remove_tears_down_and_reattach_restores() {
    let mem = MemBdev::create("lc-hot-base", 512, 65_536).unwrap();
    create_disk(config("lc-hot-base", "lc-hot-pt")).unwrap();

    let removed = Arc::new(Mutex::new(false));
    let r = removed.clone();
    let desc = BdevDesc::open(
        "lc-hot-pt",
        true,
        Box::new(move |event, _| {
            if event == BdevEvent::Remove {
                *r.lock().unwrap() = true;
            }
        }),
    )
    .unwrap();
    let ch = desc.io_channel();

    mem.destroy();
    assert!(*removed.lock().unwrap());
    assert!(bdev::registry::get("lc-hot-pt").is_none());

    // I/O on the dangling descriptor fails instead of reaching the base.
    assert!(matches!(
        desc.write_blocks(
            &ch,
            SharedBuf::from_bytes(&[1; 4096]).unwrap(),
            0,
            1,
            Box::new(|_, _| {}),
        ),
        Err(SubmitError::Removed)
    ));
    desc.close();

    // The configured name survived, so the device reattaches when the
    // base comes back.
    let mem = MemBdev::create("lc-hot-base", 512, 65_536).unwrap();
    assert!(bdev::registry::get("lc-hot-pt").is_some());

    delete_disk("lc-hot-pt", |r| r.unwrap());
    mem.destroy();
}

#[test]
fn dump_info_names_the_device_and_its_base() {
    let mem = MemBdev::create("lc-info-base", 512, 65_536).unwrap();
    create_disk(config("lc-info-base", "lc-info-pt")).unwrap();

    let info = bdev::registry::get("lc-info-pt").unwrap().dump_info();
    assert_eq!(info["passthru"]["name"], "lc-info-pt");
    assert_eq!(info["passthru"]["base_bdev_name"], "lc-info-base");

    delete_disk("lc-info-pt", |r| r.unwrap());
    mem.destroy();
}

#[test]
fn config_json_replays_the_create_call() {
    let mem = MemBdev::create("lc-json-base", 512, 65_536).unwrap();
    create_disk(config("lc-json-base", "lc-json-pt")).unwrap();

    let records = config_json();
    let record = records
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["params"]["name"] == "lc-json-pt")
        .expect("device missing from config_json");
    assert_eq!(record["method"], "bdev_passthru_create");
    assert_eq!(record["params"]["base_bdev_name"], "lc-json-base");
    assert!(record["params"]["uuid"].is_string());

    delete_disk("lc-json-pt", |r| r.unwrap());
    assert!(!config_json()
        .as_array()
        .unwrap()
        .iter()
        .any(|r| r["params"]["name"] == "lc-json-pt"));
    mem.destroy();
}

#[test]
fn explicit_uuid_is_kept_and_derived_uuid_is_deterministic() {
    let mem = MemBdev::create("lc-uuid-base", 512, 65_536).unwrap();

    let explicit = uuid::Uuid::from_u128(0x1234_5678_9abc_def0_1234_5678_9abc_def0);
    let mut cfg = config("lc-uuid-base", "lc-uuid-pt");
    cfg.uuid = Some(explicit);
    create_disk(cfg).unwrap();
    assert_eq!(
        bdev::registry::get("lc-uuid-pt").unwrap().uuid(),
        explicit
    );
    delete_disk("lc-uuid-pt", |r| r.unwrap());

    // Without an explicit UUID the derivation from the base is stable
    // across reattach.
    create_disk(config("lc-uuid-base", "lc-uuid-pt2")).unwrap();
    let first = bdev::registry::get("lc-uuid-pt2").unwrap().uuid();
    delete_disk("lc-uuid-pt2", |r| r.unwrap());
    create_disk(config("lc-uuid-base", "lc-uuid-pt2")).unwrap();
    assert_eq!(bdev::registry::get("lc-uuid-pt2").unwrap().uuid(), first);
    delete_disk("lc-uuid-pt2", |r| r.unwrap());

    mem.destroy();
}

#[test]
fn successful_io_then_clean_delete() {
    let mem = MemBdev::create("lc-rw-base", 512, 65_536).unwrap();
    create_disk(config("lc-rw-base", "lc-rw-pt")).unwrap();
    let desc = BdevDesc::open("lc-rw-pt", true, Box::new(|_, _| {})).unwrap();
    let ch = desc.io_channel();

    let status = Arc::new(Mutex::new(None));
    let s = status.clone();
    desc.write_blocks(
        &ch,
        SharedBuf::from_bytes(&[0x55; 4096]).unwrap(),
        1,
        1,
        Box::new(move |_, st| {
            *s.lock().unwrap() = Some(st);
        }),
    )
    .unwrap();
    assert_eq!(status.lock().unwrap().take(), Some(IoStatus::Success));

    desc.close();
    delete_disk("lc-rw-pt", |r| r.unwrap());
    assert!(bdev::registry::get("lc-rw-pt").is_none());
    mem.destroy();
}
