#[must_use]
pub(crate) enum HumanFmt {
    Size(u64),
    Rate(u64, std::time::Duration),
    Time(std::time::Duration),
}

impl std::fmt::Display for HumanFmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[inline]
        #[must_use]
        const fn precision(value: f64) -> usize {
            if value > 100.0 {
                0
            } else if value > 10.0 {
                1
            } else {
                2
            }
        }

        #[expect(clippy::cast_precision_loss)]
        match *self {
            Self::Size(bytes) => {
                if bytes < 1000 {
                    return f.write_fmt(format_args!("{bytes}B"));
                }
                let mut size = bytes as f64 / 1000.0;
                for unit in ["kB", "MB", "GB"] {
                    if size < 1000.0 {
                        return f.write_fmt(format_args!("{size:.0$}{unit}", precision(size)));
                    }
                    size /= 1000.0;
                }
                f.write_fmt(format_args!("{size:.0$}TB", precision(size)))
            }
            Self::Rate(bytes, time) => {
                let secs = time.as_secs_f64();
                if secs == 0.0 {
                    return f.write_fmt(format_args!("???B/s"));
                }
                let mut rate = bytes as f64 / secs;
                if rate < 1000.0 {
                    return f.write_fmt(format_args!("{rate:.0}B/s"));
                }
                rate /= 1000.0;
                for unit in ["kB/s", "MB/s", "GB/s"] {
                    if rate < 1000.0 {
                        return f.write_fmt(format_args!("{rate:.0$}{unit}", precision(rate)));
                    }
                    rate /= 1000.0;
                }
                f.write_fmt(format_args!("{rate:.0$}TB/s", precision(rate)))
            }
            Self::Time(time) => {
                let nanos = time.as_nanos();
                if nanos < 1000 {
                    return f.write_fmt(format_args!("{nanos}ns"));
                }
                let mut time = nanos as f64 / 1000.0;
                for unit in ["us", "ms"] {
                    if time < 1000.0 {
                        return f.write_fmt(format_args!("{time:.0$}{unit}", precision(time)));
                    }
                    time /= 1000.0;
                }
                if time < 60.0 {
                    return f.write_fmt(format_args!("{time:.0$}s", precision(time)));
                }
                let mins = (time / 60.0) as u64;
                let secs = (time % 60.0) as u64;
                f.write_fmt(format_args!("{mins}m{secs}s"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_size() {
        assert_eq!(format!("{}", HumanFmt::Size(0)), "0B");
        assert_eq!(format!("{}", HumanFmt::Size(999)), "999B");
        assert_eq!(format!("{}", HumanFmt::Size(1000)), "1.00kB");
        assert_eq!(format!("{}", HumanFmt::Size(1_500_000)), "1.50MB");
        assert_eq!(format!("{}", HumanFmt::Size(123_000_000_000)), "123GB");
    }

    #[test]
    fn test_time() {
        assert_eq!(format!("{}", HumanFmt::Time(Duration::from_nanos(10))), "10ns");
        assert_eq!(format!("{}", HumanFmt::Time(Duration::from_micros(15))), "15.0us");
        assert_eq!(format!("{}", HumanFmt::Time(Duration::from_millis(250))), "250ms");
        assert_eq!(format!("{}", HumanFmt::Time(Duration::from_secs(5))), "5.00s");
        assert_eq!(format!("{}", HumanFmt::Time(Duration::from_secs(90))), "1m30s");
    }

    #[test]
    fn test_rate() {
        assert_eq!(
            format!("{}", HumanFmt::Rate(2000, Duration::from_secs(1))),
            "2.00kB/s"
        );
        assert_eq!(format!("{}", HumanFmt::Rate(500, Duration::ZERO)), "???B/s");
    }
}
