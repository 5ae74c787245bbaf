use std::fmt::{Debug, Display, Formatter};

use nom::character::complete::{alpha0, char, satisfy, space0};
use nom::combinator::{all_consuming, map, map_res, opt};
use nom::error::{ErrorKind, FromExternalError, ParseError};
use nom::multi::many0;
use nom::sequence::{preceded, terminated, tuple};
use nom::{AsChar, IResult};

pub enum ParserError<I> {
    Custom(anyhow::Error),
    Nom(I, ErrorKind),
}

impl<I: Debug> Debug for ParserError<I> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Custom(error) => f.write_fmt(format_args!("Semantic error at {error}")),
            Self::Nom(input, error) => f.write_fmt(format_args!(
                "Parser error at '{input:?}': expecting {error:?}"
            )),
        }
    }
}

impl<I> ParseError<I> for ParserError<I> {
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        ParserError::Nom(input, kind)
    }

    fn append(_: I, _: ErrorKind, other: Self) -> Self {
        other
    }
}

impl<I: Display, E: Into<anyhow::Error>> FromExternalError<I, E> for ParserError<I> {
    fn from_external_error(input: I, _: ErrorKind, error: E) -> Self {
        ParserError::Custom(anyhow::anyhow!("'{}': {}", input, error.into()))
    }
}

pub(crate) fn format_parse_error<I: Debug>(error: nom::Err<ParserError<I>>) -> anyhow::Error {
    match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => anyhow::anyhow!("{:?}", e),
        _ => anyhow::anyhow!(error.to_string()),
    }
}

pub type NomResult<'a, Ret> = IResult<&'a str, Ret, ParserError<&'a str>>;

/// Runs `parser` on the whole (trimmed) input and fails if anything remains.
pub fn consume_all<'a, Ret>(
    parser: impl FnMut(&'a str) -> NomResult<'a, Ret>,
    input: &'a str,
) -> anyhow::Result<Ret> {
    all_consuming(parser)(input.trim())
        .map(|(_, value)| value)
        .map_err(format_parse_error)
}

fn p_integer_string(input: &str) -> NomResult<String> {
    let parser = tuple((
        satisfy(|c| c.is_dec_digit()),
        many0(satisfy(|c| c.is_dec_digit() || c == '_')),
    ));
    map(parser, |(first, rest)| {
        let mut number = first.to_string();
        number.extend(rest.into_iter().filter(|c| c.is_dec_digit()));
        number
    })(input)
}

pub fn p_u32(input: &str) -> NomResult<u32> {
    map_res(p_integer_string, |number| number.parse::<u32>())(input)
}

pub fn p_u64(input: &str) -> NomResult<u64> {
    map_res(p_integer_string, |number| number.parse::<u64>())(input)
}

/// `[[HH:]MM:]SS`
pub fn p_hms_time(input: &str) -> NomResult<std::time::Duration> {
    map_res(
        tuple((
            p_u32,
            opt(preceded(char(':'), p_u32)),
            opt(preceded(char(':'), p_u32)),
        )),
        |parsed| match parsed {
            (seconds, None, None) => Ok(std::time::Duration::from_secs(seconds as u64)),
            (minutes, Some(seconds), None) => Ok(std::time::Duration::from_secs(
                minutes as u64 * 60 + seconds as u64,
            )),
            (hours, Some(minutes), Some(seconds)) => Ok(std::time::Duration::from_secs(
                hours as u64 * 3600 + minutes as u64 * 60 + seconds as u64,
            )),
            _ => Err(anyhow::anyhow!("Invalid time specification")),
        },
    )(input)
}

fn memory_unit_multiplier(unit: &str) -> anyhow::Result<(u64, u64)> {
    // (numerator, denominator) relative to one mebibyte
    let unit = unit.to_lowercase();
    if unit == "b" {
        return Ok((1, 1024 * 1024));
    }
    let unit = unit
        .strip_suffix("ib")
        .or_else(|| unit.strip_suffix('b'))
        .unwrap_or(unit.as_str());
    Ok(match unit {
        "k" => (1, 1024),
        "" | "m" => (1, 1),
        "g" => (1024, 1),
        "t" => (1024 * 1024, 1),
        _ => anyhow::bail!("Unknown memory unit"),
    })
}

/// Memory amount with an optional unit (`4GB`, `512mb`, `2G`, `100`).
/// A missing unit means megabytes. The result is in mebibytes, rounded up.
pub fn p_memory_mib(input: &str) -> NomResult<u64> {
    map_res(
        tuple((terminated(p_u64, space0), alpha0)),
        |(amount, unit): (u64, &str)| -> anyhow::Result<u64> {
            let (num, denom) = memory_unit_multiplier(unit)?;
            let value = amount
                .checked_mul(num)
                .ok_or_else(|| anyhow::anyhow!("Memory amount is too large"))?;
            Ok(value.div_ceil(denom))
        },
    )(input)
}

#[cfg(test)]
mod tests {
    use super::{consume_all, p_hms_time, p_memory_mib, p_u32};
    use nom::combinator::all_consuming;
    use std::time::Duration;

    #[test]
    fn test_parse_u32() {
        assert_eq!(all_consuming(p_u32)("0").unwrap().1, 0);
        assert_eq!(all_consuming(p_u32)("1").unwrap().1, 1);
        assert_eq!(all_consuming(p_u32)("1_019").unwrap().1, 1019);
    }

    #[test]
    fn test_parse_u32_empty() {
        assert!(all_consuming(p_u32)("").is_err());
    }

    #[test]
    fn test_parse_hms() {
        assert_eq!(
            consume_all(p_hms_time, "01:00:00").unwrap(),
            Duration::from_secs(3600)
        );
        assert_eq!(
            consume_all(p_hms_time, "2:05").unwrap(),
            Duration::from_secs(125)
        );
        assert_eq!(consume_all(p_hms_time, "42").unwrap(), Duration::from_secs(42));
        assert!(consume_all(p_hms_time, "1:2:3:4").is_err());
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(consume_all(p_memory_mib, "4GB").unwrap(), 4096);
        assert_eq!(consume_all(p_memory_mib, "4gb").unwrap(), 4096);
        assert_eq!(consume_all(p_memory_mib, "2G").unwrap(), 2048);
        assert_eq!(consume_all(p_memory_mib, "512MB").unwrap(), 512);
        assert_eq!(consume_all(p_memory_mib, "1 GiB").unwrap(), 1024);
        assert_eq!(consume_all(p_memory_mib, "100").unwrap(), 100);
        assert_eq!(consume_all(p_memory_mib, "1500kb").unwrap(), 2);
        assert_eq!(consume_all(p_memory_mib, "1T").unwrap(), 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_invalid() {
        assert!(consume_all(p_memory_mib, "GB").is_err());
        assert!(consume_all(p_memory_mib, "4XB").is_err());
        assert!(consume_all(p_memory_mib, "4GB extra").is_err());
    }
}
