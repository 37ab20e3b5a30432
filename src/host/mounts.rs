//! Mount Table Reader
//!
//! Parses the kernel mount table (`/proc/self/mounts` format) into
//! (device, path) records. The table is re-read on every call.

use crate::domain::volume::MountRecord;
use crate::error::{Error, Result};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Read and parse a mount table file
pub fn read_mount_table(path: &Path) -> Result<Vec<MountRecord>> {
    let content = fs::read_to_string(path)?;
    let mounts = parse_mount_table(&content)?;
    debug!(path = %path.display(), count = mounts.len(), "read mount table");
    Ok(mounts)
}

/// Parse mount table content.
///
/// Each line is `device path fstype options dump pass`; only the first two
/// fields are kept. Blank lines are ignored.
pub fn parse_mount_table(content: &str) -> Result<Vec<MountRecord>> {
    let mut mounts = Vec::new();

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (device, path) = match (fields.next(), fields.next()) {
            (Some(device), Some(path)) => (device, path),
            _ => {
                return Err(Error::MountTableParse(format!(
                    "line {}: expected device and mount path: {}",
                    lineno + 1,
                    line
                )))
            }
        };

        mounts.push(MountRecord::new(unescape(device), unescape(path)));
    }

    Ok(mounts)
}

/// Decode the kernel's octal escapes (`\040` for space, `\011` for tab, ...)
fn unescape(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_string();
    }

    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const SAMPLE: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/xvdf /var/lib/csi-volume-bridge/volumes/data ext4 rw,relatime 0 0
devtmpfs /var/lib/kubelet/pods/blk devtmpfs rw,size=4k 0 0

/dev/xvdg /mnt/with\\040space xfs rw 0 0
";

    #[test]
    fn test_parse_mount_table() {
        let mounts = parse_mount_table(SAMPLE).unwrap();
        assert_eq!(mounts.len(), 5);
        assert_eq!(
            mounts[2],
            MountRecord::new("/dev/xvdf", "/var/lib/csi-volume-bridge/volumes/data")
        );
        assert_eq!(mounts[3].device, "devtmpfs");
    }

    #[test]
    fn test_octal_escapes_are_decoded() {
        let mounts = parse_mount_table(SAMPLE).unwrap();
        assert_eq!(mounts[4].path, "/mnt/with space");
        assert_eq!(unescape("a\\011b"), "a\tb");
        assert_eq!(unescape("back\\134slash"), "back\\slash");
        // not an escape: left as is
        assert_eq!(unescape("trailing\\04"), "trailing\\04");
    }

    #[test]
    fn test_malformed_line_is_error() {
        let res = parse_mount_table("/dev/sda1\n");
        assert_matches!(res, Err(Error::MountTableParse(_)));
    }

    #[test]
    fn test_read_mount_table_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mounts");
        fs::write(&path, SAMPLE).unwrap();

        let mounts = read_mount_table(&path).unwrap();
        assert_eq!(mounts.len(), 5);
    }
}
