use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

fn time_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"time=(\d+):(\d{1,2}):(\d{1,2})(?:\.(\d+))?").expect("valid progress pattern")
    })
}

/// Extracts the `time=HH:MM:SS.fraction` field from an ffmpeg status line.
pub fn parse_progress_time(line: &str) -> Option<Duration> {
    let captures = time_pattern().captures(line)?;
    let hours: u64 = captures.get(1)?.as_str().parse().ok()?;
    let minutes: u64 = captures.get(2)?.as_str().parse().ok()?;
    let seconds: u64 = captures.get(3)?.as_str().parse().ok()?;
    let total = hours
        .checked_mul(3600)?
        .checked_add(minutes * 60)?
        .checked_add(seconds)?;
    let elapsed = Duration::from_secs(total);
    let Some(fraction) = captures.get(4) else {
        return Some(elapsed);
    };
    // Digits past nanosecond precision are dropped.
    let digits = &fraction.as_str()[..fraction.as_str().len().min(9)];
    let value: u64 = digits.parse().ok()?;
    let scale = 10u64.pow(9 - digits.len() as u32);
    elapsed.checked_add(Duration::from_nanos(value * scale))
}

/// Renders an elapsed time the way ffmpeg prints it (`HH:MM:SS.cc`).
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let centis = elapsed.subsec_millis() / 10;
    format!(
        "{:02}:{:02}:{:02}.{:02}",
        total / 3600,
        (total / 60) % 60,
        total % 60,
        centis
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ffmpeg_status_line() {
        let line = "frame= 2410 fps= 50 q=-1.0 size=   12288kB time=00:01:20.35 bitrate=1252.1kbits/s speed=1.01x";
        assert_eq!(
            parse_progress_time(line),
            Some(Duration::from_millis(80_350))
        );
    }

    #[test]
    fn parses_long_recordings_and_missing_fraction() {
        assert_eq!(
            parse_progress_time("size=N/A time=12:00:05 bitrate=N/A"),
            Some(Duration::from_secs(12 * 3600 + 5))
        );
    }

    #[test]
    fn overflowing_hours_are_rejected() {
        assert_eq!(parse_progress_time("time=5124095576030432:00:00.00"), None);
        assert_eq!(parse_progress_time("time=99999999999999999999:00:00"), None);
        assert_eq!(
            parse_progress_time("time=5124095576030431:00:00"),
            Some(Duration::from_secs(5_124_095_576_030_431 * 3600))
        );
    }

    #[test]
    fn ignores_lines_without_time() {
        assert_eq!(parse_progress_time("Input #0, flv, from 'rtmp://x'"), None);
        assert_eq!(parse_progress_time("size=N/A time=N/A bitrate=N/A"), None);
    }

    #[test]
    fn formats_like_ffmpeg() {
        assert_eq!(format_elapsed(Duration::from_millis(3_723_450)), "01:02:03.45");
        assert_eq!(format_elapsed(Duration::ZERO), "00:00:00.00");
    }
}
