use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// The one line the agent's sidecar parameters file carries: the runtime
/// script to execute, the port the controller listens on, and the
/// base-address offset `SymbolResolver` needs to translate offline symbol
/// addresses into live ones.
///
/// Wire format: `<script path>,<port>,<base offset>\n` — plain ASCII, no
/// quoting, no escaping. Written by the launcher next to the agent's
/// on-disk `.so`, read once by `AgentBootstrap`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarParams {
    pub script_path: PathBuf,
    pub port: u16,
    pub base_offset: u64,
}

#[derive(Debug, Error)]
pub enum SidecarParseError {
    #[error("sidecar line is missing a field (expected script,port,offset): {0:?}")]
    MissingField(String),
    #[error("sidecar port field is not a valid u16: {0}")]
    BadPort(#[source] std::num::ParseIntError),
    #[error("sidecar offset field is not a valid u64: {0}")]
    BadOffset(#[source] std::num::ParseIntError),
}

impl SidecarParams {
    pub fn parse_line(line: &str) -> Result<Self, SidecarParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut fields = line.splitn(3, ',');
        let script = fields
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SidecarParseError::MissingField(line.to_string()))?;
        let port = fields
            .next()
            .ok_or_else(|| SidecarParseError::MissingField(line.to_string()))?;
        let offset = fields
            .next()
            .ok_or_else(|| SidecarParseError::MissingField(line.to_string()))?;

        Ok(SidecarParams {
            script_path: PathBuf::from(script),
            port: port.parse().map_err(SidecarParseError::BadPort)?,
            base_offset: offset.parse().map_err(SidecarParseError::BadOffset)?,
        })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{},{},{}\n",
            self.script_path.display(),
            self.port,
            self.base_offset
        )
    }
}

impl fmt::Display for SidecarParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} (base_offset=0x{:x})",
            self.script_path.display(),
            self.port,
            self.base_offset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_line() {
        let p = SidecarParams::parse_line("/opt/agent/entry.py,9321,4096\n").unwrap();
        assert_eq!(p.script_path, PathBuf::from("/opt/agent/entry.py"));
        assert_eq!(p.port, 9321);
        assert_eq!(p.base_offset, 4096);
    }

    #[test]
    fn round_trips() {
        let p = SidecarParams {
            script_path: PathBuf::from("/tmp/x.py"),
            port: 1,
            base_offset: 0,
        };
        let back = SidecarParams::parse_line(&p.to_line()).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn rejects_missing_field() {
        assert!(SidecarParams::parse_line("/tmp/x.py,9321").is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(SidecarParams::parse_line("/tmp/x.py,notaport,0").is_err());
    }
}
