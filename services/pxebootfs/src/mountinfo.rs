//! Kernel mount table inspection.
//!
//! Parses `/proc/self/mountinfo` (see proc(5)). Only the fields needed to
//! decide "is something mounted here, and what" are kept.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default location of the mount table.
pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
}

/// Read and parse a mountinfo file.
pub fn read_mount_table(path: &Path) -> io::Result<Vec<MountEntry>> {
    let text = fs::read_to_string(path)?;
    Ok(parse_mountinfo(&text))
}

/// Parse mountinfo text. Malformed lines are skipped.
pub fn parse_mountinfo(text: &str) -> Vec<MountEntry> {
    text.lines().filter_map(parse_line).collect()
}

/// The mount currently visible at `path`, if any.
///
/// When several mounts are stacked on one point the last one listed wins,
/// which is the one the kernel resolves lookups through.
pub fn mount_at<'a>(entries: &'a [MountEntry], path: &Path) -> Option<&'a MountEntry> {
    entries.iter().rev().find(|entry| entry.mount_point == path)
}

fn parse_line(line: &str) -> Option<MountEntry> {
    // 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
    let (left, right) = line.split_once(" - ")?;

    let mut left = left.split_whitespace();
    let mount_point = left.nth(4)?;

    let mut right = right.split_whitespace();
    let fs_type = right.next()?;
    let source = right.next().unwrap_or("none");

    Some(MountEntry {
        mount_point: PathBuf::from(unescape(mount_point)),
        fs_type: fs_type.to_string(),
        source: unescape(source),
    })
}

/// Undo the kernel's octal escaping of space, tab, newline and backslash.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal(&bytes[i + 1..i + 4]) {
            let value = (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal(digits: &[u8]) -> bool {
    digits.len() == 3 && digits[0] <= b'3' && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
41 22 0:36 / /netboot/node/0A000005 rw,relatime shared:20 - overlay overlay rw,lowerdir=/srv/root,upperdir=/srv/overlay/0A000005/upper,workdir=/srv/overlay/0A000005/work
42 22 0:37 / /netboot/node/0A000006 rw,relatime - aufs none rw,si=1f2e
43 22 0:38 / /mnt/with\\040space rw - tmpfs tmpfs rw
garbage line without separator
";

    #[test]
    fn test_parse_sample() {
        let entries = parse_mountinfo(SAMPLE);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[1].mount_point, PathBuf::from("/netboot/node/0A000005"));
        assert_eq!(entries[1].fs_type, "overlay");
        assert_eq!(entries[2].fs_type, "aufs");
        assert_eq!(entries[2].source, "none");
    }

    #[test]
    fn test_octal_escapes_decoded() {
        let entries = parse_mountinfo(SAMPLE);
        assert_eq!(entries[3].mount_point, PathBuf::from("/mnt/with space"));
    }

    #[test]
    fn test_mount_at_prefers_last_stacked() {
        let text = "\
50 22 0:40 / /netboot/node/0A000007 rw - tmpfs tmpfs rw
51 50 0:41 / /netboot/node/0A000007 rw - overlay overlay rw
";
        let entries = parse_mountinfo(text);
        let entry = mount_at(&entries, Path::new("/netboot/node/0A000007")).unwrap();
        assert_eq!(entry.fs_type, "overlay");
    }

    #[test]
    fn test_mount_at_requires_exact_path() {
        let entries = parse_mountinfo(SAMPLE);
        assert!(mount_at(&entries, Path::new("/netboot/node")).is_none());
        assert!(mount_at(&entries, Path::new("/netboot/node/0A00000")).is_none());
    }

    #[test]
    fn test_read_mount_table_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mountinfo");
        std::fs::write(&path, SAMPLE).unwrap();

        let entries = read_mount_table(&path).unwrap();
        assert_eq!(entries.len(), 4);
    }
}
