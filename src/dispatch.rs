//! AT dispatcher: matches a framed command line against a static, ordered prefix table and
//! parses it into a [`Command`] for [`crate::handlers`] to execute.

/// A parsed AT command, ready for a handler in [`crate::handlers`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// `ATA`
    Answer,
    /// `ATD<number>;`
    Dial { number: String },
    /// `AT+VGS=<n>`
    SpeakerGain { value: i32 },
    /// `AT+VGM=<n>`
    MicrophoneGain { value: i32 },
    /// `AT+BRSF=<mask>`
    Brsf { hf_features: u32 },
    /// `AT+CIND=?`
    CindTest,
    /// `AT+CIND?`
    CindRead,
    /// `AT+CMER=<m>,<k>,<d>,<i>[,<b>]`
    Cmer { mode: i32, ind: i32 },
    /// `AT+CHLD=?`
    ChldTest,
    /// `AT+CHLD=<cmd>`
    Chld { action: String },
    /// `AT+CHUP`
    Chup,
    /// `AT+CKPD=200`
    Ckpd,
    /// `AT+CLIP=<0|1>`
    Clip { enabled: bool },
    /// `AT+BTRH=<n>`
    BtrhSet { value: i32 },
    /// `AT+BTRH?`
    BtrhRead,
    /// `AT+BLDN`
    LastDialed,
    /// `AT+VTS=<ch>`
    Dtmf { tone: char },
    /// `AT+CNUM`
    SubscriberNumber,
    /// `AT+CLCC`
    ListCalls,
    /// `AT+COPS?`
    OperatorRead,
    /// `AT+COPS=<mode>,<format>`
    OperatorSet,
    /// `AT+NREC=<0|1>`
    Nrec { enabled: bool },
    /// `AT+CCWA=<0|1>`
    CallWaiting { enabled: bool },
    /// `AT+CMEE=<0|1>`
    ExtendedErrors { enabled: bool },
}

/// Why a raw line could not be turned into a [`Command`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// No table entry's prefix matched.
    UnknownCommand,
    /// The prefix matched but the argument(s) were malformed or out of range.
    InvalidArgument,
}

fn parse_trailing_bool(rest: &str) -> Result<bool, ParseError> {
    match rest {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(ParseError::InvalidArgument),
    }
}

fn parse_int(s: &str) -> Result<i32, ParseError> {
    s.trim().parse::<i32>().map_err(|_| ParseError::InvalidArgument)
}

/// Parses one framed AT command line (without the trailing `\r`) into a [`Command`].
///
/// The ordered prefix table mirrors §4.D: first literal-prefix match wins, `AT+VGS`/`AT+VGM`
/// share a single `AT+VG` dispatch point that branches on the next byte exactly as the
/// original reference AG's event table does.
pub fn parse(line: &str) -> Result<Command, ParseError> {
    if line == "ATA" {
        return Ok(Command::Answer);
    }
    if let Some(rest) = line.strip_prefix("ATD") {
        return match rest.strip_suffix(';') {
            Some(number) if !number.is_empty() => Ok(Command::Dial { number: number.to_string() }),
            _ => Err(ParseError::InvalidArgument),
        };
    }
    if let Some(rest) = line.strip_prefix("AT+VGS=") {
        let value = parse_int(rest)?;
        return Ok(Command::SpeakerGain { value });
    }
    if let Some(rest) = line.strip_prefix("AT+VGM=") {
        let value = parse_int(rest)?;
        return Ok(Command::MicrophoneGain { value });
    }
    if let Some(rest) = line.strip_prefix("AT+BRSF=") {
        let mask = parse_int(rest)?;
        if mask < 0 {
            return Err(ParseError::InvalidArgument);
        }
        return Ok(Command::Brsf { hf_features: mask as u32 });
    }
    if line == "AT+CIND=?" {
        return Ok(Command::CindTest);
    }
    if line == "AT+CIND?" {
        return Ok(Command::CindRead);
    }
    if let Some(rest) = line.strip_prefix("AT+CMER=") {
        let fields: Vec<&str> = rest.split(',').collect();
        if fields.len() < 4 {
            return Err(ParseError::InvalidArgument);
        }
        let mode = parse_int(fields[0])?;
        let ind = parse_int(fields[3])?;
        if ind != 0 && ind != 1 {
            return Err(ParseError::InvalidArgument);
        }
        return Ok(Command::Cmer { mode, ind });
    }
    if line == "AT+CHLD=?" {
        return Ok(Command::ChldTest);
    }
    if let Some(rest) = line.strip_prefix("AT+CHLD=") {
        if rest.is_empty() {
            return Err(ParseError::InvalidArgument);
        }
        return Ok(Command::Chld { action: rest.to_string() });
    }
    if line == "AT+CHUP" {
        return Ok(Command::Chup);
    }
    if line.starts_with("AT+CKPD") {
        return Ok(Command::Ckpd);
    }
    if let Some(rest) = line.strip_prefix("AT+CLIP=") {
        return Ok(Command::Clip { enabled: parse_trailing_bool(rest)? });
    }
    if let Some(rest) = line.strip_prefix("AT+BTRH=") {
        let value = parse_int(rest)?;
        return Ok(Command::BtrhSet { value });
    }
    if line == "AT+BTRH?" {
        return Ok(Command::BtrhRead);
    }
    if line == "AT+BLDN" {
        return Ok(Command::LastDialed);
    }
    if let Some(rest) = line.strip_prefix("AT+VTS=") {
        let mut chars = rest.chars();
        let tone = chars.next().ok_or(ParseError::InvalidArgument)?;
        if chars.next().is_some() {
            return Err(ParseError::InvalidArgument);
        }
        return Ok(Command::Dtmf { tone });
    }
    if line == "AT+CNUM" {
        return Ok(Command::SubscriberNumber);
    }
    if line == "AT+CLCC" {
        return Ok(Command::ListCalls);
    }
    if line == "AT+COPS?" {
        return Ok(Command::OperatorRead);
    }
    if line.starts_with("AT+COPS=") {
        return Ok(Command::OperatorSet);
    }
    if let Some(rest) = line.strip_prefix("AT+NREC=") {
        return Ok(Command::Nrec { enabled: parse_trailing_bool(rest)? });
    }
    if let Some(rest) = line.strip_prefix("AT+CCWA=") {
        return Ok(Command::CallWaiting { enabled: parse_trailing_bool(rest)? });
    }
    if let Some(rest) = line.strip_prefix("AT+CMEE=") {
        return Ok(Command::ExtendedErrors { enabled: parse_trailing_bool(rest)? });
    }
    Err(ParseError::UnknownCommand)
}
