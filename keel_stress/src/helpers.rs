use std::{fmt, str::FromStr};

use bytesize::ByteSize;
use rand::Rng;
use snafu::Snafu;

#[derive(Debug, Clone, Snafu)]
pub enum SizeRangeError {
    #[snafu(display("Empty size range"))]
    Empty,
    #[snafu(display("Invalid size range: {min} is larger than {max}"))]
    Invalid { min: ByteSize, max: ByteSize },
    #[snafu(display("Failed to parse size {value:?}: {message}"))]
    Parse { value: String, message: String },
}

/// An inclusive range of sizes, written `512B` or `64B-2KiB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRange {
    min: ByteSize,
    max: ByteSize,
}

impl SizeRange {
    pub fn min(&self) -> ByteSize {
        self.min
    }

    pub fn max(&self) -> ByteSize {
        self.max
    }

    /// Pick a size uniformly from the range, in bytes.
    pub fn sample(&self, rng: &mut impl Rng) -> usize {
        let size = rng.random_range(self.min.as_u64()..=self.max.as_u64());
        usize::try_from(size).unwrap_or(usize::MAX)
    }
}

impl FromStr for SizeRange {
    type Err = SizeRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SizeRangeError::Empty);
        }

        let (min, max) = match s.split_once('-') {
            Some((min, max)) => (parse_size(min)?, parse_size(max)?),
            None => {
                let size = parse_size(s)?;
                (size, size)
            }
        };

        if min > max {
            return Err(SizeRangeError::Invalid { min, max });
        }

        Ok(Self { min, max })
    }
}

impl fmt::Display for SizeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}-{}", self.min, self.max)
        }
    }
}

fn parse_size(value: &str) -> Result<ByteSize, SizeRangeError> {
    value
        .trim()
        .parse::<ByteSize>()
        .map_err(|message| SizeRangeError::Parse {
            value: value.to_string(),
            message,
        })
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn test_parse_single_size() {
        let range: SizeRange = "512B".parse().unwrap();
        assert_eq!(range.min(), ByteSize::b(512));
        assert_eq!(range.max(), ByteSize::b(512));
    }

    #[test]
    fn test_parse_range() {
        let range: SizeRange = " 64B - 2KiB ".parse().unwrap();
        assert_eq!(range.min(), ByteSize::b(64));
        assert_eq!(range.max(), ByteSize::kib(2));
    }

    #[test]
    fn test_parse_invalid() {
        assert!("".parse::<SizeRange>().is_err());
        assert!("abc".parse::<SizeRange>().is_err());
        assert!("10B-abc".parse::<SizeRange>().is_err());
        assert!(matches!(
            "2KiB-64B".parse::<SizeRange>(),
            Err(SizeRangeError::Invalid { .. })
        ));
    }

    #[test]
    fn test_sample_stays_in_range() {
        let range: SizeRange = "100B-200B".parse().unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let size = range.sample(&mut rng);
            assert!((100..=200).contains(&size));
        }
    }
}
