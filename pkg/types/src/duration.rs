use anyhow::bail;
use chrono::Duration;

/// Parse a reservation duration string.
///
/// Accepts ISO8601 (`PT1H30M`, `P1DT12H`, `PT30S`) and compact suffix form
/// (`90s`, `5m`, `1h30m`, `2d`). Values are whole seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("duration must not be empty");
    }
    let secs = if s.starts_with('P') {
        parse_iso8601(s)?
    } else {
        parse_compact(s)?
    };
    Ok(Duration::seconds(secs))
}

fn parse_iso8601(s: &str) -> anyhow::Result<i64> {
    let body = &s[1..];
    let (date_part, time_part) = match body.split_once('T') {
        Some((d, t)) => (d, t),
        None => (body, ""),
    };

    let mut secs: i64 = 0;
    let mut acc = String::new();
    for c in date_part.chars() {
        if c.is_ascii_digit() {
            acc.push(c);
        } else if c == 'D' {
            secs += take_number(&mut acc, s)? * 86_400;
        } else {
            bail!("unsupported designator '{}' in duration '{}'", c, s);
        }
    }
    if !acc.is_empty() {
        bail!("trailing digits without designator in duration '{}'", s);
    }
    for c in time_part.chars() {
        if c.is_ascii_digit() {
            acc.push(c);
        } else {
            let n = take_number(&mut acc, s)?;
            secs += match c {
                'H' => n * 3600,
                'M' => n * 60,
                'S' => n,
                other => bail!("unsupported designator '{}' in duration '{}'", other, s),
            };
        }
    }
    if !acc.is_empty() {
        bail!("trailing digits without designator in duration '{}'", s);
    }
    Ok(secs)
}

fn parse_compact(s: &str) -> anyhow::Result<i64> {
    let mut secs: i64 = 0;
    let mut acc = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            acc.push(c);
        } else {
            let n = take_number(&mut acc, s)?;
            secs += match c {
                's' => n,
                'm' => n * 60,
                'h' => n * 3600,
                'd' => n * 86_400,
                other => bail!("unsupported unit '{}' in duration '{}'", other, s),
            };
        }
    }
    if !acc.is_empty() {
        bail!("duration '{}' is missing a unit (use s, m, h, or d)", s);
    }
    Ok(secs)
}

fn take_number(acc: &mut String, original: &str) -> anyhow::Result<i64> {
    if acc.is_empty() {
        bail!("duration '{}' has a unit without a value", original);
    }
    let n = acc
        .parse::<i64>()
        .map_err(|_| anyhow::anyhow!("bad number in duration '{}'", original))?;
    acc.clear();
    Ok(n)
}
