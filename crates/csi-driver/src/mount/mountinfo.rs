//! `/proc/self/mountinfo` parsing.
//!
//! Format, per proc(5):
//!
//! ```text
//! 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
//! (1)(2)(3)   (4)   (5)      (6)      (7)   (8) (9)   (10)         (11)
//! ```
//!
//! The mount point (5) and source (10) fields are octal-escaped; a mount
//! point containing a space arrives as `\040`.

use std::path::PathBuf;

/// One mount table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mount point, unescaped.
    pub mount_point: PathBuf,
    /// Mount source, unescaped. A device path for block mounts.
    pub source: PathBuf,
    /// Filesystem type.
    pub fs_type: String,
    /// Per-mount options (field 6).
    pub options: Vec<String>,
}

/// Parses mountinfo content. Malformed lines are skipped.
pub fn parse_mountinfo(content: &str) -> Vec<MountEntry> {
    content.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<MountEntry> {
    let (mount_part, fs_part) = line.split_once(" - ")?;

    let mount_fields: Vec<&str> = mount_part.split_whitespace().collect();
    if mount_fields.len() < 6 {
        return None;
    }
    let mount_point = unescape(mount_fields[4]);
    let options = mount_fields[5].split(',').map(str::to_string).collect();

    let mut fs_fields = fs_part.split_whitespace();
    let fs_type = fs_fields.next()?.to_string();
    let source = unescape(fs_fields.next()?);

    Some(MountEntry {
        mount_point: PathBuf::from(mount_point),
        source: PathBuf::from(source),
        fs_type,
        options,
    })
}

/// Reverses the kernel's octal escaping (`\040` space, `\011` tab, `\012`
/// newline, `\134` backslash). Unknown escapes are kept verbatim.
pub fn unescape(field: &str) -> String {
    let mut result = String::with_capacity(field.len());
    let bytes = field.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let octal = &field[i + 1..i + 4];
            if octal.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
                if let Ok(value) = u8::from_str_radix(octal, 8) {
                    result.push(value as char);
                    i += 4;
                    continue;
                }
            }
        }
        result.push(bytes[i] as char);
        i += 1;
    }
    result
}
