//! # twinctl selftest
//!
//! Drives the mmap coherency scenario through the real synchronizer using
//! the in-memory engine and page cache: map, fault page 0, write through the
//! file interface, then check the page without repopulating it. Finishes
//! with a store through the mapping and an fsync.

use std::sync::Arc;

use anyhow::{bail, Result};
use console::{style, Emoji};
use twincache_config::{log_cli_info, Config};
use twincache_core::testing::{MemEngine, MemPageCache};
use twincache_core::{
    Credential, FileObject, FileOperations, MapRegion, OpenFlags, OpenMode, VmFlags,
};

static CHECK: Emoji<'_, '_> = Emoji("✔ ", "[ok] ");
static CROSS: Emoji<'_, '_> = Emoji("✘ ", "[!!] ");

const PATTERN: &[u8; 10] = b"0123456789";

struct Report {
    passed: u32,
    failed: u32,
}

impl Report {
    fn new() -> Self {
        Self {
            passed: 0,
            failed: 0,
        }
    }

    fn check(&mut self, ok: bool, msg: &str) {
        if ok {
            self.passed += 1;
            println!("  {} {}", CHECK, style(msg).green());
        } else {
            self.failed += 1;
            println!("  {} {}", CROSS, style(msg).red());
        }
    }
}

pub fn cmd_selftest(config: &Config) -> Result<()> {
    let page_size = config.cache.effective_page_size();
    let engine = Arc::new(MemEngine::new(page_size));
    let cache = Arc::new(MemPageCache::with_config(&config.cache, &config.writeback));
    let ops = FileOperations::new(Arc::clone(&engine), Arc::clone(&cache));

    let cred = Credential::new(1000, 1000);
    let object = FileObject::regular(1, cred.uid);
    engine.create(&object, &vec![0u8; page_size * 2]);

    println!("{}", style("twincache selftest").bold().cyan());
    println!("{}", style(format!("page size {}", page_size)).dim());

    let mut report = Report::new();
    let mode = OpenMode::READ | OpenMode::WRITE;
    let mut handle = ops.open(object, mode, OpenFlags::empty(), &cred)?;
    let object = Arc::clone(handle.object());

    let region = MapRegion::new(
        0,
        0x7f00_0000_0000,
        (page_size * 2) as u64,
        VmFlags::READ | VmFlags::WRITE | VmFlags::SHARED,
    );
    ops.mmap(&handle, &region)?;
    report.check(object.is_mapped(), "mapping established");

    let page = cache.fault(ops.synchronizer(), &object, 0)?;
    let fills = engine.calls().get_pages;
    report.check(fills == 1, "page 0 faulted in with one fill");

    let written = ops.write(&mut handle, PATTERN, &cred)?;
    report.check(written == PATTERN.len(), "write accepted in full");

    let contents = page.contents();
    report.check(
        &contents[..PATTERN.len()] == PATTERN,
        "write visible in resident page",
    );
    report.check(engine.calls().get_pages == fills, "no repopulate after write");
    report.check(cache.page_count(&object) == 1, "write created no pages");

    cache.store(&object, 0, PATTERN.len(), b"mmap");
    ops.fsync(&handle, false, &cred)?;
    let on_engine = engine.contents(&object);
    report.check(
        &on_engine[PATTERN.len()..PATTERN.len() + 4] == b"mmap",
        "mapped store written back by fsync",
    );

    ops.release(handle, &cred)?;

    log_cli_info!(
        "Selftest finished",
        passed = report.passed,
        failed = report.failed
    );
    println!();
    if report.failed > 0 {
        println!("{}", style("FAIL").red().bold());
        bail!("{} check(s) failed", report.failed);
    }
    println!("{}", style("PASS").green().bold());
    Ok(())
}
