//! Parsing of operator-typed sky coordinates.
//!
//! Accepted forms, RA first:
//! - decimal degrees, optionally suffixed `d` or `deg`: `10.0 -30.0`, `10.0d, -30.0d`
//! - sexagesimal with unit letters: `00h40m00s -30d00m00s`
//! - sexagesimal with colons (RA in hours): `00:40:00 -30:00:00`
//! - six bare tokens (RA in hours): `00 40 00 -30 00 00`

use std::sync::LazyLock;

use regex::Regex;

use super::SearchError;
use super::sky::SkyCoord;

// `12h30m15.5s`, `-30d05m`, `45d`
static LETTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<deg>\d+(?:\.\d*)?)(?P<unit>[hd])(?:(?P<min>\d+(?:\.\d*)?)m)?(?:(?P<sec>\d+(?:\.\d*)?)s)?$",
    )
    .unwrap()
});

static SEPARATOR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[,\s]+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Ra,
    Dec,
}

impl Axis {
    fn name(self) -> &'static str {
        match self {
            Axis::Ra => "RA",
            Axis::Dec => "Dec",
        }
    }
}

/// Parse a single coordinate pair.
pub fn parse_sky_coordinate(text: &str) -> Result<SkyCoord, SearchError> {
    let tokens: Vec<&str> = SEPARATOR_RE
        .split(text.trim())
        .filter(|t| !t.is_empty())
        .collect();
    match tokens.as_slice() {
        [ra, dec] => coord(parse_ra(ra)?, parse_dec(dec)?),
        [h, m, s, d, dm, ds] => {
            let ra = parse_ra(&format!("{h}:{m}:{s}"))?;
            let dec = parse_dec(&format!("{d}:{dm}:{ds}"))?;
            coord(ra, dec)
        }
        _ => Err(SearchError::Parse(format!(
            "Could not parse {:?} as on-sky coordinates",
            text.trim()
        ))),
    }
}

/// Right ascension in degrees. Bare numbers are degrees; sexagesimal is hours.
pub fn parse_ra(token: &str) -> Result<f64, SearchError> {
    parse_angle(token, Axis::Ra)
}

/// Declination in degrees.
pub fn parse_dec(token: &str) -> Result<f64, SearchError> {
    parse_angle(token, Axis::Dec)
}

fn coord(ra: f64, dec: f64) -> Result<SkyCoord, SearchError> {
    if !(0.0..=90.0).contains(&dec.abs()) {
        return Err(SearchError::OutOfRange(format!(
            "Dec {dec} outside [-90, 90]"
        )));
    }
    if !(0.0..360.0).contains(&ra) {
        return Err(SearchError::OutOfRange(format!("RA {ra} outside [0, 360)")));
    }
    Ok(SkyCoord::new(ra, dec))
}

fn parse_angle(token: &str, axis: Axis) -> Result<f64, SearchError> {
    let token = token.trim();
    let bad = || SearchError::Parse(format!("Invalid {}: {:?}", axis.name(), token));

    let decimal = token
        .strip_suffix("deg")
        .or_else(|| token.strip_suffix('d'))
        .unwrap_or(token);
    if let Ok(value) = decimal.parse::<f64>() {
        return if value.is_finite() { Ok(value) } else { Err(bad()) };
    }

    let (negative, unsigned) = match token.as_bytes().first() {
        Some(b'-') => (true, &token[1..]),
        Some(b'+') => (false, &token[1..]),
        _ => (false, token),
    };

    let (whole, minutes, seconds, hours) = if let Some(caps) = LETTER_RE.captures(unsigned) {
        let num = |name: &str| -> Result<f64, SearchError> {
            caps.name(name)
                .map_or(Ok(0.0), |m| m.as_str().parse::<f64>().map_err(|_| bad()))
        };
        let hours = &caps["unit"] == "h";
        (num("deg")?, num("min")?, num("sec")?, hours)
    } else if unsigned.contains(':') {
        let parts: Vec<&str> = unsigned.split(':').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(bad());
        }
        let mut values = [0.0; 3];
        for (slot, part) in values.iter_mut().zip(&parts) {
            *slot = part.parse::<f64>().map_err(|_| bad())?;
        }
        (values[0], values[1], values[2], axis == Axis::Ra)
    } else {
        return Err(bad());
    };

    if minutes >= 60.0 || seconds >= 60.0 || whole < 0.0 {
        return Err(bad());
    }
    if hours && axis == Axis::Dec {
        return Err(bad());
    }

    let magnitude = whole + minutes / 60.0 + seconds / 3600.0;
    let degrees = if hours { magnitude * 15.0 } else { magnitude };
    Ok(if negative { -degrees } else { degrees })
}
