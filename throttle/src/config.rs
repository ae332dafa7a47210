//! Configuration wire-format parsing (§6).
//!
//! Each cgroupfs file accepts one command per write; which direction and
//! limit kind a line configures is determined by which file it was
//! written to, not by the line's own content — so parsing here takes the
//! target file as a parameter and only has to make sense of the
//! device-spec/value fields. Pure and allocation-free, so it is usable
//! directly from tests without a filesystem in the loop.

use crate::bio::{Dir, FakeDeviceId};
use crate::error::ThrottleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Bps,
    Iops,
}

/// Which cgroupfs control file a line was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFile {
    ReadBpsDevice,
    WriteBpsDevice,
    RwBpsDevice,
    ReadIopsDevice,
    WriteIopsDevice,
    RwIopsDevice,
    HybridReadBpsDevice,
    HybridWriteBpsDevice,
}

impl ConfigFile {
    fn dir(self) -> Dir {
        match self {
            ConfigFile::ReadBpsDevice | ConfigFile::ReadIopsDevice | ConfigFile::HybridReadBpsDevice => {
                Dir::READ
            }
            ConfigFile::WriteBpsDevice
            | ConfigFile::WriteIopsDevice
            | ConfigFile::HybridWriteBpsDevice => Dir::WRITE,
            ConfigFile::RwBpsDevice | ConfigFile::RwIopsDevice => Dir::RANDW,
        }
    }

    fn kind(self) -> LimitKind {
        match self {
            ConfigFile::ReadBpsDevice
            | ConfigFile::WriteBpsDevice
            | ConfigFile::RwBpsDevice
            | ConfigFile::HybridReadBpsDevice
            | ConfigFile::HybridWriteBpsDevice => LimitKind::Bps,
            ConfigFile::ReadIopsDevice | ConfigFile::WriteIopsDevice | ConfigFile::RwIopsDevice => {
                LimitKind::Iops
            }
        }
    }

    fn is_hybrid(self) -> bool {
        matches!(
            self,
            ConfigFile::HybridReadBpsDevice | ConfigFile::HybridWriteBpsDevice
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLine {
    SetDeviceLimit {
        dir: Dir,
        kind: LimitKind,
        major: u32,
        minor: u32,
        value: i64,
    },
    SetFakeDeviceLimit {
        dir: Dir,
        kind: LimitKind,
        fd_id: FakeDeviceId,
        major: u32,
        minor: u32,
        value: i64,
    },
}

fn invalid(reason: &'static str) -> ThrottleError {
    ThrottleError::InvalidArgument { reason }
}

/// Parse `"MAJOR:MINOR"`, rejecting a non-zero trailing `:PARTITION`.
fn parse_device_spec(spec: &str) -> Result<(u32, u32), ThrottleError> {
    let mut fields = spec.split(':');
    let major = fields
        .next()
        .ok_or(invalid("missing device major"))?
        .parse::<u32>()
        .map_err(|_| invalid("device major is not a number"))?;
    let minor = fields
        .next()
        .ok_or(invalid("missing device minor"))?
        .parse::<u32>()
        .map_err(|_| invalid("device minor is not a number"))?;
    if let Some(partition) = fields.next() {
        let partition: u32 = partition
            .parse()
            .map_err(|_| invalid("partition is not a number"))?;
        if partition != 0 {
            return Err(invalid("partition device references are not supported"));
        }
    }
    if fields.next().is_some() {
        return Err(invalid("malformed device spec"));
    }
    Ok((major, minor))
}

/// Parse one config write against the given target file.
pub fn parse_line(file: ConfigFile, line: &str) -> Result<ConfigLine, ThrottleError> {
    let mut fields = line.split_whitespace();

    let device_spec = fields.next().ok_or(invalid("empty config line"))?;
    let (major, minor) = parse_device_spec(device_spec)?;

    if file.is_hybrid() {
        let fd_id = fields
            .next()
            .ok_or(invalid("missing fake device id"))?
            .parse::<FakeDeviceId>()
            .map_err(|_| invalid("fake device id is not a number"))?;
        let value = fields
            .next()
            .ok_or(invalid("missing limit value"))?
            .parse::<i64>()
            .map_err(|_| invalid("limit value is not a number"))?;
        if value < 0 {
            return Err(invalid("limit value must not be negative"));
        }
        if fields.next().is_some() {
            return Err(invalid("trailing fields in hybrid config line"));
        }
        Ok(ConfigLine::SetFakeDeviceLimit {
            dir: file.dir(),
            kind: file.kind(),
            fd_id,
            major,
            minor,
            value,
        })
    } else {
        let value = fields
            .next()
            .ok_or(invalid("missing limit value"))?
            .parse::<i64>()
            .map_err(|_| invalid("limit value is not a number"))?;
        if value < 0 {
            return Err(invalid("limit value must not be negative"));
        }
        if fields.next().is_some() {
            return Err(invalid("trailing fields in config line"));
        }
        Ok(ConfigLine::SetDeviceLimit {
            dir: file.dir(),
            kind: file.kind(),
            major,
            minor,
            value,
        })
    }
}
