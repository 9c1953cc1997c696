use crate::Error;
use std::fmt;

/// One registered path in a `REDIRECT` message body.
///
/// `service` is set when the path was registered with `svc:path` instead of
/// a bare path, and is what lets peers resolve `/portal/list?name=svc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    pub service: Option<String>,
    pub path: String,
}

/// One peer token in a `PEER` message body: `host[:port][=exp]`.
///
/// `expiration` is `None` for a bare host, which the caller interprets
/// according to context (a static config `PEER` line means permanent; a
/// live gossip `PEER` line without `=exp` falls back to the sender's
/// default lease).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub host: String,
    pub expiration: Option<i64>,
}

/// A decoded control message, already stripped of any trailing signature
/// suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `[ts] target [HIDE] [PID:n] [svc:]path…`
    Redirect {
        timestamp: Option<i64>,
        target: String,
        hide: bool,
        pid: Option<u32>,
        paths: Vec<PathEntry>,
    },
    /// `[ts] host[=exp] …`
    Peer {
        timestamp: Option<i64>,
        peers: Vec<PeerEntry>,
    },
    /// Restricts UDP control traffic to loopback; no arguments.
    Local,
    /// `method hex-key`, a static config directive only.
    Sign { method: String, key_hex: String },
}

fn trim_control_end(s: &str) -> &str {
    s.trim_end_matches(|c: char| c.is_control() || c.is_whitespace())
}

/// Splits a raw wire line into its body and an optional ` <METHOD>
/// <HEXSIG>` suffix. The suffix is only recognized when the last token is
/// 8 lowercase hex characters and the token before it is a known signing
/// method name — anything else is left as part of the body, since `SIGN`
/// directives and plain paths can themselves end in tokens that merely
/// look hex-ish.
pub fn strip_signature(line: &str) -> (&str, Option<(&str, &str)>) {
    let trimmed = trim_control_end(line);

    let (head, sig) = match trimmed.rsplit_once(char::is_whitespace) {
        Some(split) => split,
        None => return (trimmed, None),
    };

    if !is_hex8(sig) {
        return (trimmed, None);
    }

    let head = head.trim_end();
    let (body, method) = match head.rsplit_once(char::is_whitespace) {
        Some(split) => split,
        None => return (trimmed, None),
    };

    if crate::SignMethod::parse(method).is_none() {
        return (trimmed, None);
    }

    (body.trim_end(), Some((method, sig)))
}

fn is_hex8(tok: &str) -> bool {
    tok.len() == 8 && tok.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

fn parse_peer_token(tok: &str) -> PeerEntry {
    match tok.rsplit_once('=') {
        Some((host, exp)) if !host.is_empty() => PeerEntry {
            host: host.to_string(),
            expiration: exp.parse().ok(),
        },
        _ => PeerEntry {
            host: tok.to_string(),
            expiration: None,
        },
    }
}

impl Message {
    /// Parses a message body (i.e. already stripped of any signature
    /// suffix via [`strip_signature`]).
    pub fn parse(body: &str) -> Result<Self, Error> {
        let body = trim_control_end(body);
        let mut tokens = body.split_whitespace();
        let keyword = tokens.next().ok_or(Error::Malformed)?;

        match keyword {
            "REDIRECT" => Self::parse_redirect(tokens),
            "PEER" => Self::parse_peer(tokens),
            "LOCAL" => Ok(Message::Local),
            "SIGN" => Self::parse_sign(tokens),
            _ => Err(Error::UnknownKeyword),
        }
    }

    fn parse_redirect<'a>(tokens: impl Iterator<Item = &'a str>) -> Result<Self, Error> {
        let mut tokens = tokens.peekable();
        let first = tokens.next().ok_or(Error::Malformed)?;

        let (timestamp, target) = match first.parse::<i64>() {
            Ok(ts) => (Some(ts), tokens.next().ok_or(Error::Malformed)?),
            Err(_) => (None, first),
        };

        if target.is_empty() {
            return Err(Error::Malformed);
        }

        let mut hide = false;
        let mut pid = None;
        let mut paths = Vec::new();

        for tok in tokens {
            if tok == "HIDE" {
                hide = true;
            } else if let Some(rest) = tok.strip_prefix("PID:") {
                pid = Some(rest.parse().map_err(|_| Error::Malformed)?);
            } else if let Some((svc, path)) = tok.split_once(':') {
                if path.starts_with('/') {
                    paths.push(PathEntry {
                        service: Some(svc.to_string()),
                        path: path.to_string(),
                    });
                } else {
                    paths.push(PathEntry {
                        service: None,
                        path: tok.to_string(),
                    });
                }
            } else {
                paths.push(PathEntry {
                    service: None,
                    path: tok.to_string(),
                });
            }
        }

        if paths.is_empty() || paths.iter().any(|p| p.path.len() < 2 || !p.path.starts_with('/')) {
            return Err(Error::Malformed);
        }

        Ok(Message::Redirect {
            timestamp,
            target: target.to_string(),
            hide,
            pid,
            paths,
        })
    }

    fn parse_peer<'a>(tokens: impl Iterator<Item = &'a str>) -> Result<Self, Error> {
        let mut tokens = tokens.peekable();
        let first = tokens.next().ok_or(Error::Malformed)?;

        let (timestamp, leading_peer) = match first.parse::<i64>() {
            Ok(ts) => (Some(ts), None),
            Err(_) => (None, Some(first)),
        };

        let mut peers: Vec<PeerEntry> = leading_peer.into_iter().map(parse_peer_token).collect();
        peers.extend(tokens.map(parse_peer_token));

        if peers.is_empty() {
            return Err(Error::Malformed);
        }

        Ok(Message::Peer { timestamp, peers })
    }

    fn parse_sign<'a>(mut tokens: impl Iterator<Item = &'a str>) -> Result<Self, Error> {
        let method = tokens.next().ok_or(Error::Malformed)?;
        let key_hex = tokens.next().ok_or(Error::Malformed)?;

        Ok(Message::Sign {
            method: method.to_string(),
            key_hex: key_hex.to_string(),
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Redirect {
                timestamp,
                target,
                hide,
                pid,
                paths,
            } => {
                write!(f, "REDIRECT")?;
                if let Some(ts) = timestamp {
                    write!(f, " {}", ts)?;
                }
                write!(f, " {}", target)?;
                if *hide {
                    write!(f, " HIDE")?;
                }
                if let Some(pid) = pid {
                    write!(f, " PID:{}", pid)?;
                }
                for p in paths {
                    match &p.service {
                        Some(svc) => write!(f, " {}:{}", svc, p.path)?,
                        None => write!(f, " {}", p.path)?,
                    }
                }
                Ok(())
            }
            Message::Peer { timestamp, peers } => {
                write!(f, "PEER")?;
                if let Some(ts) = timestamp {
                    write!(f, " {}", ts)?;
                }
                for p in peers {
                    write!(f, " {}", p.host)?;
                    if let Some(exp) = p.expiration {
                        write!(f, "={}", exp)?;
                    }
                }
                Ok(())
            }
            Message::Local => write!(f, "LOCAL"),
            Message::Sign { method, key_hex } => write!(f, "SIGN {} {}", method, key_hex),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_live_redirect() {
        let line = "REDIRECT 1700000000 127.0.0.1:9001 HIDE PID:4242 web:/shop";
        let msg = Message::parse(line).unwrap();
        assert_eq!(msg.to_string(), line);
        assert!(matches!(msg, Message::Redirect { hide: true, .. }));
    }

    #[test]
    fn round_trips_static_redirect() {
        let line = "REDIRECT 127.0.0.1:9000 /api";
        let msg = Message::parse(line).unwrap();
        assert_eq!(msg.to_string(), line);
        assert!(matches!(
            msg,
            Message::Redirect {
                timestamp: None,
                ..
            }
        ));
    }

    #[test]
    fn round_trips_peer() {
        let line = "PEER 1700000000 host-a host-b=1700000180";
        let msg = Message::parse(line).unwrap();
        assert_eq!(msg.to_string(), line);
    }

    #[test]
    fn strips_trailing_signature() {
        let line = "REDIRECT 1700000000 127.0.0.1:9001 PID:1 web:/shop SHA-256 00112233";
        let (body, suffix) = strip_signature(line);
        assert_eq!(body, "REDIRECT 1700000000 127.0.0.1:9001 PID:1 web:/shop");
        assert_eq!(suffix, Some(("SHA-256", "00112233")));
    }

    #[test]
    fn leaves_unsigned_body_untouched() {
        let line = "REDIRECT 1700000000 127.0.0.1:9001 PID:1 web:/shop";
        let (body, suffix) = strip_signature(line);
        assert_eq!(body, line);
        assert_eq!(suffix, None);
    }

    #[test]
    fn rejects_unknown_keyword() {
        assert_eq!(Message::parse("FOO bar"), Err(Error::UnknownKeyword));
    }

    #[test]
    fn rejects_short_path() {
        assert_eq!(
            Message::parse("REDIRECT 1700000000 host:1 /"),
            Err(Error::Malformed)
        );
    }
}
