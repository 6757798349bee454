//! Readers for numeric, boolean and string tunables.
//!
//! The `*_with` readers take a lookup function, so configuration can be
//! parsed from any key/value source. The `*_from_env` readers consult the
//! process environment.

fn read_float_and_factor(value: Option<String>) -> Option<(f64, usize)> {
    let mut value = value?;
    if value.is_empty() {
        return None;
    }

    if value.len() > 1 && (value.ends_with('b') || value.ends_with('B')) {
        value.pop();
    }

    let (digits, factor) = match value.as_bytes()[value.len() - 1] {
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'k' | b'K' => (&value[..value.len() - 1], 1024),
        _ => (value.as_str(), 1),
    };

    match digits.trim().parse::<f64>() {
        Ok(x) if x >= 0.0 => Some((x, factor)),
        _ => None,
    }
}

/// Reads an unsigned integer, accepting `K`, `M` and `G` suffixes.
pub fn read_uint_with(lookup: impl Fn(&str) -> Option<String>, var: &str) -> Option<usize> {
    let (value, factor) = read_float_and_factor(lookup(var))?;

    Some((value * factor as f64) as usize)
}

pub fn read_bool_with(lookup: impl Fn(&str) -> Option<String>, var: &str) -> Option<bool> {
    match lookup(var)?.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn env_lookup(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

pub fn read_uint_from_env(var: &str) -> Option<usize> {
    read_uint_with(env_lookup, var)
}

pub fn read_string_from_env(var: &str) -> Option<String> {
    env_lookup(var)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(value: &'static str) -> impl Fn(&str) -> Option<String> {
        move |_| Some(value.to_string())
    }

    #[test]
    fn test_uint_suffixes() {
        assert_eq!(read_uint_with(lookup("12"), "X"), Some(12));
        assert_eq!(read_uint_with(lookup("4k"), "X"), Some(4096));
        assert_eq!(read_uint_with(lookup("2MB"), "X"), Some(2 * 1024 * 1024));
        assert_eq!(read_uint_with(lookup("1G"), "X"), Some(1024 * 1024 * 1024));
        assert_eq!(read_uint_with(lookup("1.5k"), "X"), Some(1536));
        assert_eq!(read_uint_with(lookup("nope"), "X"), None);
        assert_eq!(read_uint_with(lookup(""), "X"), None);
        assert_eq!(read_uint_with(|_| None, "X"), None);
    }

    #[test]
    fn test_bools() {
        assert_eq!(read_bool_with(lookup("TRUE"), "X"), Some(true));
        assert_eq!(read_bool_with(lookup("off"), "X"), Some(false));
        assert_eq!(read_bool_with(lookup("maybe"), "X"), None);
    }
}
