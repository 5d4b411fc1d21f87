//! Line protocol for `karma run`.
//!
//! ```text
//! open <id> [domain] [resolution]
//! activate <id>
//! close <id>
//! online | offline | sync | status
//! ```

use karma_runtime::ResourceSignal;
use tab_accounting::{EmissionProfile, ResourceId, VideoResolution};

#[derive(Debug, PartialEq)]
pub enum InputCommand {
    Signal(ResourceSignal),
    Online(bool),
    Sync,
    Status,
}

/// Parse one input line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<InputCommand>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    let command = match (verb, args.as_slice()) {
        ("open", [id]) => InputCommand::Signal(ResourceSignal::Opened {
            id: parse_id(id)?,
            profile: None,
        }),
        ("open", [id, domain]) => InputCommand::Signal(ResourceSignal::Opened {
            id: parse_id(id)?,
            profile: Some(EmissionProfile::for_domain(*domain)),
        }),
        ("open", [id, domain, resolution]) => {
            let resolution = VideoResolution::parse(resolution)
                .ok_or_else(|| format!("unknown resolution: {}", resolution))?;
            InputCommand::Signal(ResourceSignal::Opened {
                id: parse_id(id)?,
                profile: Some(EmissionProfile::for_domain(*domain).with_resolution(resolution)),
            })
        }
        ("activate", [id]) => InputCommand::Signal(ResourceSignal::Activated(parse_id(id)?)),
        ("close", [id]) => InputCommand::Signal(ResourceSignal::Closed(parse_id(id)?)),
        ("online", []) => InputCommand::Online(true),
        ("offline", []) => InputCommand::Online(false),
        ("sync", []) => InputCommand::Sync,
        ("status", []) => InputCommand::Status,
        _ => return Err(format!("unrecognized command: {}", line)),
    };
    Ok(Some(command))
}

fn parse_id(raw: &str) -> Result<ResourceId, String> {
    raw.parse::<u64>()
        .map(ResourceId)
        .map_err(|_| format!("invalid resource id: {}", raw))
}
