//! Attach-time bring-up of the metadata region: restore from disk,
//! zero-fill, chunked reads, and failure handling.

use std::sync::{Arc, Mutex};

use bdev::{BdevDesc, ExtIoOpts, IoStatus, IoType, MemBdev, SharedBuf};
use passthru::{create_disk, CreateError, MetadataInit, PassthruConfig};

fn read_md(desc: &BdevDesc, lba: u64, md_len: usize) -> Vec<u8> {
    let ch = desc.io_channel();
    let block_len = desc.bdev().block_len() as usize;
    let md_out = SharedBuf::zeroed(md_len, 64).unwrap();
    let status = Arc::new(Mutex::new(None));
    let s = status.clone();
    desc.readv_blocks_ext(
        &ch,
        vec![SharedBuf::zeroed(block_len, 64).unwrap()],
        lba,
        1,
        ExtIoOpts {
            memory_domain: None,
            metadata: Some(md_out.clone()),
        },
        Box::new(move |_, st| {
            *s.lock().unwrap() = Some(st);
        }),
    )
    .unwrap();
    assert_eq!(status.lock().unwrap().take(), Some(IoStatus::Success));
    md_out.to_vec()
}

#[test]
fn restore_mode_reads_the_prefix_into_the_shadow() {
    let mem = MemBdev::create("hyd-restore-base", 512, 1_000_000).unwrap();
    mem.fill_blocks(0, 200, 0xa5);

    let mut config = PassthruConfig::new("hyd-restore-base", "hyd-restore-pt");
    config.block_size = 4096;
    config.md_size = 8;
    config.mode = MetadataInit::Restore;
    create_disk(config).unwrap();

    let desc = BdevDesc::open("hyd-restore-pt", true, Box::new(|_, _| {})).unwrap();
    assert_eq!(read_md(&desc, 0, 8), vec![0xa5; 8]);
    // Guest block 512's metadata starts at prefix byte 4096, inside the
    // seeded span.
    assert_eq!(read_md(&desc, 512, 8), vec![0xa5; 8]);

    desc.close();
    mem.destroy();
}

#[test]
fn zero_mode_wipes_the_prefix_and_the_shadow_reads_zero() {
    let mem = MemBdev::create("hyd-zero-base", 512, 1_000_000).unwrap();
    mem.fill_blocks(0, 200, 0xa5);

    let mut config = PassthruConfig::new("hyd-zero-base", "hyd-zero-pt");
    config.block_size = 4096;
    config.md_size = 8;
    config.mode = MetadataInit::Zero;
    create_disk(config).unwrap();

    // The on-disk prefix was zeroed at attach.
    assert!(mem.read_raw(0, 200).iter().all(|b| *b == 0));
    assert_eq!(mem.submission_count(IoType::WriteZeroes), 1);

    let desc = BdevDesc::open("hyd-zero-pt", true, Box::new(|_, _| {})).unwrap();
    assert_eq!(read_md(&desc, 0, 8), vec![0; 8]);

    desc.close();
    mem.destroy();
}

#[test]
fn large_prefixes_hydrate_in_bounded_chunks() {
    // 128 metadata bytes per 512-byte block reserves a quarter of the
    // device: 10_000 guest blocks, well above the 4096-block chunk limit.
    let mem = MemBdev::create("hyd-chunk-base", 512, 40_000).unwrap();
    mem.fill_blocks(0, 10_000, 0x5a);

    let mut config = PassthruConfig::new("hyd-chunk-base", "hyd-chunk-pt");
    config.md_size = 128;
    config.mode = MetadataInit::Restore;
    create_disk(config).unwrap();

    let reads: Vec<_> = mem
        .submissions()
        .into_iter()
        .filter(|r| r.io_type == IoType::Read)
        .collect();
    assert_eq!(reads.len(), 3);
    assert_eq!(reads[0].offset_blocks, 0);
    assert_eq!(reads[0].num_blocks, 4096);
    assert_eq!(reads[1].offset_blocks, 4096);
    assert_eq!(reads[1].num_blocks, 4096);
    assert_eq!(reads[2].offset_blocks, 8192);
    assert_eq!(reads[2].num_blocks, 10_000 - 8192);

    let desc = BdevDesc::open("hyd-chunk-pt", true, Box::new(|_, _| {})).unwrap();
    // Guest block 20_000's metadata sits at prefix byte 2_560_000, which
    // only the second chunk covers.
    assert_eq!(read_md(&desc, 20_000, 128), vec![0x5a; 128]);

    desc.close();
    mem.destroy();
}

#[test]
fn hydration_failure_fails_creation() {
    let mem = MemBdev::create("hyd-fail-base", 512, 1_000_000).unwrap();
    mem.fail_after(0, 1);

    let mut config = PassthruConfig::new("hyd-fail-base", "hyd-fail-pt");
    config.block_size = 4096;
    config.md_size = 8;
    config.mode = MetadataInit::Restore;
    let err = create_disk(config).unwrap_err();
    assert!(matches!(err, CreateError::HydrationFailed));

    // Nothing was exposed and the base is free to claim again.
    assert!(bdev::registry::get("hyd-fail-pt").is_none());
    assert!(mem.bdev().claimed_by().is_none());

    mem.destroy();
}

#[test]
fn no_metadata_means_no_hydration_io() {
    let mem = MemBdev::create("hyd-none-base", 512, 4096).unwrap();
    let config = PassthruConfig::new("hyd-none-base", "hyd-none-pt");
    create_disk(config).unwrap();

    assert_eq!(mem.submission_count(IoType::Read), 0);
    assert_eq!(mem.submission_count(IoType::WriteZeroes), 0);
    let pt = bdev::registry::get("hyd-none-pt").unwrap();
    assert_eq!(pt.block_count(), 4096);
    assert_eq!(pt.md_len(), 0);

    let desc = BdevDesc::open("hyd-none-pt", true, Box::new(|_, _| {})).unwrap();
    desc.close();
    mem.destroy();
}
