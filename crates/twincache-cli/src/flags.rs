//! `twinctl flags`: decode flag words and dry-run set-flags requests.

use anyhow::Result;
use twincache_config::log_cli_debug;
use twincache_core::flags::{self, FS_FL_USER_MODIFIABLE, FS_FL_USER_VISIBLE};
use twincache_core::testing::MemEngine;
use twincache_core::{Credential, Error, FileObject, InodeFlags};

const OWNER_UID: u32 = 1000;

/// Parse a flag word given as decimal or `0x`-prefixed hex.
pub fn parse_word(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid flag word '{}': {}", s, e))
}

pub fn cmd_decode(word: u32) -> Result<()> {
    let flags = InodeFlags::from_bits_retain(word);
    println!("{:#010x}  {}", word, flags::describe(flags));
    let hidden = word & !FS_FL_USER_VISIBLE;
    if hidden != 0 {
        println!("not user-visible: {:#x}", hidden);
    }
    let fixed = word & !FS_FL_USER_MODIFIABLE;
    if fixed != 0 {
        println!("not user-modifiable: {:#x}", fixed);
    }
    Ok(())
}

/// Run the request through the full set path against a scratch object and
/// report the verdict. A rejection is a normal outcome, not a failure.
pub fn cmd_check(word: u32, non_owner: bool) -> Result<()> {
    let engine = MemEngine::new(twincache_config::DEFAULT_PAGE_SIZE);
    let object = FileObject::regular(1, OWNER_UID);
    engine.create(&object, b"");

    let cred = if non_owner {
        Credential::new(OWNER_UID + 1, OWNER_UID + 1)
    } else {
        Credential::new(OWNER_UID, OWNER_UID)
    };
    log_cli_debug!("Checking set-flags request", word = word, uid = cred.uid);

    let requested = InodeFlags::from_bits_retain(word);
    match flags::set_flags(&engine, &object, requested, &cred) {
        Ok(()) => {
            let stored = flags::get_flags(&engine, &object)?;
            println!("permitted: stored {}", flags::describe(stored));
        }
        Err(err @ Error::PermissionDenied) => {
            println!("denied: EACCES ({})", err);
        }
        Err(err @ Error::Unsupported { .. }) => {
            println!("unsupported: EOPNOTSUPP ({})", err);
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}
