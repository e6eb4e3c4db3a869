//! Minimal scanning of a bundle's `Info.plist`.
//!
//! Only the two integers needed to address the image are extracted. The
//! file is scanned line by line: a `<key>name</key>` line names the value on
//! the following line, and the value is the text between the first `>` and
//! the next `<`. Everything else is ignored.

use std::path::Path;

use crate::bundle::{Bundle, BundleError};

pub const INFO_PLIST: &str = "Info.plist";

const BAND_SIZE_KEY: &str = "band-size";
const SIZE_KEY: &str = "size";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleInfo {
    pub band_size: u64,
    pub size: u64,
}

pub fn read<P: AsRef<Path>>(path: P) -> Result<BundleInfo, BundleError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| BundleError::ReadMetadata(e, path.to_path_buf()))?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<BundleInfo, BundleError> {
    let mut band_size = None;
    let mut size = None;
    let mut key: Option<&str> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("<key>") {
            key = Some(rest.strip_suffix("</key>").unwrap_or(rest));
            continue;
        }

        let Some(name) = key.take() else {
            continue;
        };

        let value = line.split_once('>').map_or(line, |(_, v)| v);
        let value = value.split('<').next().unwrap_or_default();

        match name {
            BAND_SIZE_KEY => band_size = Some(parse_size(BAND_SIZE_KEY, value)?),
            SIZE_KEY => size = Some(parse_size(SIZE_KEY, value)?),
            _ => {}
        }
    }

    Ok(BundleInfo {
        band_size: band_size.ok_or(BundleError::MissingKey(BAND_SIZE_KEY))?,
        size: size.ok_or(BundleError::MissingKey(SIZE_KEY))?,
    })
}

fn parse_size(key: &'static str, value: &str) -> Result<u64, BundleError> {
    let value = value.trim();
    let parsed = value.parse::<u64>().map_err(|_| BundleError::InvalidValue {
        key,
        value: value.to_string(),
    })?;

    if parsed > Bundle::MAX_SIZE {
        return Err(BundleError::TooLarge(parsed));
    }

    Ok(parsed)
}
