use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Returns the current wall-clock time as fractional seconds since the Unix epoch.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Parses a comma-separated list of concurrency levels, e.g. "1,5,10,20".
pub fn parse_level_list(s: &str) -> Result<Vec<usize>, String> {
    let mut levels = Vec::new();

    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let level: usize = part
            .parse()
            .map_err(|_| format!("Invalid concurrency level: '{}'", part))?;
        if level == 0 {
            return Err("Concurrency levels must be greater than zero".to_string());
        }
        levels.push(level);
    }

    if levels.is_empty() {
        return Err("Concurrency level list cannot be empty".to_string());
    }

    Ok(levels)
}

/// Generates a session id of the form `test_<unix-seconds>_<8 hex chars>`.
pub fn generate_session_id() -> String {
    let secs = unix_now() as u64;
    let suffix: u32 = rand::thread_rng().gen();
    format!("test_{}_{:08x}", secs, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_list_simple() {
        let levels = parse_level_list("1,5,10,20").unwrap();
        assert_eq!(levels, vec![1, 5, 10, 20]);
    }

    #[test]
    fn test_parse_level_list_whitespace() {
        let levels = parse_level_list(" 2 , 4 ,8 ").unwrap();
        assert_eq!(levels, vec![2, 4, 8]);
    }

    #[test]
    fn test_parse_level_list_rejects_garbage() {
        assert!(parse_level_list("1,abc").is_err());
        assert!(parse_level_list("").is_err());
        assert!(parse_level_list("1,0,5").is_err());
    }

    #[test]
    fn test_unix_now_is_recent() {
        let now = unix_now();
        // Well past 2020 and not in the far future.
        assert!(now > 1_577_836_800.0);
        assert!(now < 4_102_444_800.0);
    }

    #[test]
    fn test_generate_session_id_format() {
        let id = generate_session_id();
        assert!(id.starts_with("test_"));

        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_session_id_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
    }
}
