//! Delivery Status Notification parameters (RFC 3461).

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// How much of the message a bounce should carry (`RET=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DsnRet {
    Full,
    Headers,
}

impl fmt::Display for DsnRet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full => "FULL",
            Self::Headers => "HDRS",
        })
    }
}

impl FromStr for DsnRet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Ok(Self::Full),
            "HDRS" | "HEADERS" => Ok(Self::Headers),
            other => Err(format!("Unknown RET value: {other}")),
        }
    }
}

/// When the recipient's server should send a notification (`NOTIFY=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DsnNotify {
    Never,
    On {
        success: bool,
        failure: bool,
        delay: bool,
    },
}

impl DsnNotify {
    /// `On` without any condition, which has no `NOTIFY=` rendering.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        matches!(
            self,
            Self::On {
                success: false,
                failure: false,
                delay: false
            }
        )
    }
}

impl fmt::Display for DsnNotify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Never => f.write_str("NEVER"),
            Self::On {
                success,
                failure,
                delay,
            } => {
                let values: Vec<&str> = [
                    (success, "SUCCESS"),
                    (failure, "FAILURE"),
                    (delay, "DELAY"),
                ]
                .into_iter()
                .filter_map(|(set, name)| set.then_some(name))
                .collect();

                f.write_str(&values.join(","))
            }
        }
    }
}

impl FromStr for DsnNotify {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mut success, mut failure, mut delay) = (false, false, false);

        for value in s.split(',').map(str::trim) {
            match value.to_ascii_uppercase().as_str() {
                "NEVER" if !s.contains(',') => return Ok(Self::Never),
                "SUCCESS" => success = true,
                "FAILURE" => failure = true,
                "DELAY" => delay = true,
                other => return Err(format!("Unknown NOTIFY value: {other}")),
            }
        }

        Ok(Self::On {
            success,
            failure,
            delay,
        })
    }
}

/// Encode `value` as RFC 3461 xtext, for `ENVID` and `ORCPT`.
#[must_use]
pub fn xtext(value: &str) -> String {
    use std::fmt::Write as _;

    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        if (b'!'..=b'~').contains(&byte) && byte != b'+' && byte != b'=' {
            encoded.push(char::from(byte));
        } else {
            let _ = write!(encoded, "+{byte:02X}");
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ret_display() {
        assert_eq!(DsnRet::Full.to_string(), "FULL");
        assert_eq!(DsnRet::Headers.to_string(), "HDRS");
        assert_eq!("hdrs".parse::<DsnRet>(), Ok(DsnRet::Headers));
        assert!("partial".parse::<DsnRet>().is_err());
    }

    #[test]
    fn test_notify_display() {
        assert_eq!(DsnNotify::Never.to_string(), "NEVER");
        assert_eq!(
            DsnNotify::On {
                success: true,
                failure: true,
                delay: false
            }
            .to_string(),
            "SUCCESS,FAILURE"
        );
    }

    #[test]
    fn test_notify_without_conditions_is_empty() {
        let empty = DsnNotify::On {
            success: false,
            failure: false,
            delay: false,
        };

        assert!(empty.is_empty());
        assert!(!DsnNotify::Never.is_empty());
        assert!(
            !DsnNotify::On {
                success: false,
                failure: false,
                delay: true
            }
            .is_empty()
        );
        assert!("".parse::<DsnNotify>().is_err());
    }

    #[test]
    fn test_notify_parse() {
        assert_eq!("never".parse::<DsnNotify>(), Ok(DsnNotify::Never));
        assert_eq!(
            "failure, delay".parse::<DsnNotify>(),
            Ok(DsnNotify::On {
                success: false,
                failure: true,
                delay: true
            })
        );
        assert!("NEVER,SUCCESS".parse::<DsnNotify>().is_err());
        assert!("sometimes".parse::<DsnNotify>().is_err());
    }

    #[test]
    fn test_xtext() {
        assert_eq!(xtext("user@example.com"), "user@example.com");
        assert_eq!(xtext("a+b=c d"), "a+2Bb+3Dc+20d");
    }
}
