use super::protocol::{Command, Response};

/// Maximum length of a tube name, matching the limit documented on
/// [`Command::Watch`] and friends.
const MAX_TUBE_NAME_LEN: usize = 200;

impl TryFrom<&[u8]> for Command {
    type Error = Response;

    fn try_from(line: &[u8]) -> Result<Self, Self::Error> {
        let mut words = line.split(|&b| b == b' ').filter(|w| !w.is_empty());

        let word = |w: Option<&[u8]>| w.ok_or(Response::BadFormat);

        let name = word(words.next())?;

        let cmd = match name {
            b"put" => {
                let pri = parse_u32(word(words.next())?)?;
                let delay = parse_u32(word(words.next())?)?;
                let ttr = parse_u32(word(words.next())?)?;
                let n_bytes = parse_u32(word(words.next())?)?;
                Command::Put { pri, delay, ttr, n_bytes }
            },
            b"reserve" => Command::Reserve,
            b"reserve-with-timeout" => {
                let timeout = parse_u32(word(words.next())?)?;
                Command::ReserveWithTimeout { timeout }
            },
            b"reserve-job" => {
                let id = parse_u64(word(words.next())?)?;
                Command::ReserveJob { id }
            },
            b"delete" => {
                let id = parse_u64(word(words.next())?)?;
                Command::Delete { id }
            },
            b"release" => {
                let id = parse_u64(word(words.next())?)?;
                let pri = parse_u32(word(words.next())?)?;
                let delay = parse_u32(word(words.next())?)?;
                Command::Release { id, pri, delay }
            },
            b"bury" => {
                let id = parse_u64(word(words.next())?)?;
                let pri = parse_u32(word(words.next())?)?;
                Command::Bury { id, pri }
            },
            b"touch" => {
                let id = parse_u64(word(words.next())?)?;
                Command::Touch { id }
            },
            b"watch" => {
                let tube = parse_tube_name(word(words.next())?)?;
                Command::Watch { tube }
            },
            b"ignore" => {
                let tube = parse_tube_name(word(words.next())?)?;
                Command::Ignore { tube }
            },
            b"peek" => {
                let id = parse_u64(word(words.next())?)?;
                Command::Peek { id }
            },
            b"peek-ready" => Command::PeekReady,
            b"peek-delayed" => Command::PeekDelayed,
            b"peek-buried" => Command::PeekBuried,
            b"kick" => {
                let bound = parse_u64(word(words.next())?)?;
                Command::Kick { bound }
            },
            b"kick-job" => {
                let id = parse_u64(word(words.next())?)?;
                Command::KickJob { id }
            },
            b"stats-job" => {
                let id = parse_u64(word(words.next())?)?;
                Command::StatsJob { id }
            },
            b"stats-tube" => {
                let tube = parse_tube_name(word(words.next())?)?;
                Command::StatsTube { tube }
            },
            b"stats" => Command::StatsServer,
            b"list-tubes" => Command::ListTubes,
            b"list-tube-used" => Command::ListTubeUsed,
            b"list-tubes-watched" => Command::ListTubesWatched,
            b"quit" => Command::Quit,
            b"pause-tube" => {
                let tube = parse_tube_name(word(words.next())?)?;
                let delay = parse_u32(word(words.next())?)?;
                Command::PauseTube { tube, delay }
            },
            b"use" => {
                let tube = parse_tube_name(word(words.next())?)?;
                Command::Use { tube }
            },
            _ => return Err(Response::UnknownCommand),
        };

        if words.next().is_some() {
            return Err(Response::BadFormat);
        }

        Ok(cmd)
    }
}

fn parse_u32(word: &[u8]) -> Result<u32, Response> {
    std::str::from_utf8(word)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(Response::BadFormat)
}

fn parse_u64(word: &[u8]) -> Result<u64, Response> {
    std::str::from_utf8(word)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(Response::BadFormat)
}

/// A tube name must be non-empty, at most 200 bytes, not start with `-`
/// (reserved for future flag-like syntax), and contain only the
/// conventional beanstalk tube-name alphabet.
fn parse_tube_name(word: &[u8]) -> Result<Vec<u8>, Response> {
    if word.is_empty() || word.len() > MAX_TUBE_NAME_LEN || word[0] == b'-' {
        return Err(Response::BadFormat);
    }
    let valid = word
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b';' | b'.' | b'$' | b'_' | b'(' | b')' | b'-'));
    if !valid {
        return Err(Response::BadFormat);
    }
    Ok(word.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_put() {
        let cmd: Command = b"put 10 0 60 5".as_slice().try_into().unwrap();
        assert_eq!(cmd, Command::Put { pri: 10, delay: 0, ttr: 60, n_bytes: 5 });
    }

    #[test]
    fn parses_simple_commands() {
        assert_eq!(Command::try_from(b"reserve".as_slice()), Ok(Command::Reserve));
        assert_eq!(Command::try_from(b"quit".as_slice()), Ok(Command::Quit));
        assert_eq!(Command::try_from(b"stats".as_slice()), Ok(Command::StatsServer));
    }

    #[test]
    fn rejects_unknown_command() {
        assert_eq!(Command::try_from(b"frobnicate".as_slice()), Err(Response::UnknownCommand));
    }

    #[test]
    fn rejects_bad_numbers() {
        assert_eq!(Command::try_from(b"delete abc".as_slice()), Err(Response::BadFormat));
    }

    #[test]
    fn rejects_extra_args() {
        assert_eq!(Command::try_from(b"quit now".as_slice()), Err(Response::BadFormat));
    }

    #[test]
    fn rejects_missing_args() {
        assert_eq!(Command::try_from(b"delete".as_slice()), Err(Response::BadFormat));
    }

    #[test]
    fn parses_tube_names() {
        let cmd: Command = b"use my-tube".as_slice().try_into().unwrap();
        assert_eq!(cmd, Command::Use { tube: b"my-tube".to_vec() });
    }

    #[test]
    fn rejects_tube_name_starting_with_dash() {
        assert_eq!(Command::try_from(b"use -bad".as_slice()), Err(Response::BadFormat));
    }
}
