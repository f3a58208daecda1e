use std::fmt;

use crate::error::BusError;

/// The closed set of command tags understood by every peer.
///
/// Tags travel as short ASCII frames. Anything outside this set is rejected
/// by the codec before it can reach a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Command {
    InfoReq,
    InfoRep,
    Registration,
    Approved,
    Denied,
    Update,
    Acknowledged,
    Exit,
    Heartbeat,
}

impl Command {
    pub const ALL: [Command; 9] = [
        Command::InfoReq,
        Command::InfoRep,
        Command::Registration,
        Command::Approved,
        Command::Denied,
        Command::Update,
        Command::Acknowledged,
        Command::Exit,
        Command::Heartbeat,
    ];

    /// Wire representation of the tag.
    pub const fn tag(self) -> &'static [u8] {
        match self {
            Command::Registration => b"0x01",
            Command::Approved => b"0x02",
            Command::Denied => b"0x03",
            Command::Exit => b"0x05",
            Command::Acknowledged => b"0x06",
            Command::Update => b"0x07",
            Command::InfoReq => b"0x08",
            Command::InfoRep => b"0x09",
            Command::Heartbeat => b"<3",
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Command::InfoReq => "Info_Req",
            Command::InfoRep => "Info_Rep",
            Command::Registration => "Registration",
            Command::Approved => "Approved",
            Command::Denied => "Denied",
            Command::Update => "Update",
            Command::Acknowledged => "Acknowledged",
            Command::Exit => "Exit",
            Command::Heartbeat => "Heartbeat",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|command| command.tag() == tag)
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = BusError;

    fn try_from(tag: &[u8]) -> Result<Self, Self::Error> {
        Self::from_tag(tag)
            .ok_or_else(|| BusError::UnknownCommand(String::from_utf8_lossy(tag).into_owned()))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn tags_are_unique() {
        let tags: HashSet<&[u8]> = Command::ALL.iter().map(|c| c.tag()).collect();
        assert_eq!(tags.len(), Command::ALL.len());
    }

    #[test]
    fn every_tag_maps_back_to_its_command() {
        for command in Command::ALL {
            assert_eq!(Command::from_tag(command.tag()), Some(command));
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let result = Command::try_from(&b"0xFF"[..]);
        assert!(matches!(result, Err(BusError::UnknownCommand(tag)) if tag == "0xFF"));
        assert!(Command::from_tag(b"").is_none());
    }
}
