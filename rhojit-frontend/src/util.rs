use std::{fs::File, path::Path, sync::Arc};

/// Discards everything, for the base subscriber whose output is replaced by the layers
pub(crate) struct EmptyWriter;
impl std::io::Write for EmptyWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub(crate) fn make_log_file(path: &Path) -> std::io::Result<Arc<File>> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    Ok(Arc::new(log_file))
}

/// Whether the environment variable enables something, anything but `0` counts as enabled
pub(crate) fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name).map(|x| x != "0").unwrap_or(default)
}

/// Parse an address given in hex (with or without `0x`)
pub(crate) fn parse_address(text: &str) -> Result<u64, std::num::ParseIntError> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16)
}

/// Format code as rows of 16 hex bytes, each prefixed with its offset
pub(crate) fn hex_dump(code: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in code.chunks(16).enumerate() {
        out.push_str(&format!("{:04X}:", row * 16));
        for byte in chunk {
            out.push_str(&format!(" {:02X}", byte));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{hex_dump, parse_address};

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x7fff0000"), Ok(0x7FFF_0000));
        assert_eq!(parse_address("DEADBEEF"), Ok(0xDEAD_BEEF));
        assert!(parse_address("0xZZ").is_err());
    }

    #[test]
    fn test_hex_dump() {
        let code: Vec<u8> = (0..18).collect();
        assert_eq!(
            hex_dump(&code),
            "0000: 00 01 02 03 04 05 06 07 08 09 0A 0B 0C 0D 0E 0F\n0010: 10 11\n"
        );
    }
}
