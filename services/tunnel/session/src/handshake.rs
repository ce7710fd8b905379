//! Login handshake for client/server sessions.
//!
//! Right after the transport connects, the client sends a LOGIN frame with its
//! credentials. The server answers with LOGIN_RESULT: status `Ok` plus the
//! issued session id, or status `Fatal` when the credentials are rejected or
//! the LOGIN names a module other than the server's.

use crate::error::SessionError;
use bytes::Bytes;
use tracing::{debug, trace};
use tunnel_connector::Connector;
use tunnel_wire::{
    get_meta_str, parse_meta, CodecError, FastHeader, Flags, Frame, FrameBuilder, FrameType, StatusCode,
};

/// Size limit for control frames
pub const MAX_CONTROL_FRAME: usize = 1024 * 1024;

/// Credentials presented by a client
#[derive(Clone, PartialEq, Eq)]
pub struct Login {
    /// User name
    pub user: String,
    /// Password
    pub password: String,
    /// Name of the client module
    pub module: String,
}

impl std::fmt::Debug for Login {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Login")
            .field("user", &self.user)
            .field("module", &self.module)
            .finish()
    }
}

/// Server verdict on a LOGIN
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginResult {
    /// Credentials accepted, session issued
    Accepted {
        /// Issued session id
        session_id: String,
    },
    /// Credentials rejected
    Rejected {
        /// Reason given by the server
        reason: String,
    },
}

/// Build a LOGIN frame
pub fn build_login(msg_id: u64, login: &Login) -> Result<Bytes, CodecError> {
    FrameBuilder::new(FastHeader::new(FrameType::Login, msg_id))
        .flags(Flags::HDR_CHECKSUM)
        .meta_insert_str("user", &login.user)
        .meta_insert_str("password", &login.password)
        .meta_insert_str("module", &login.module)
        .build(MAX_CONTROL_FRAME)
}

/// Extract the credentials from a LOGIN frame
pub fn parse_login(frame: &Frame) -> Result<Login, SessionError> {
    if frame.fast.typ != FrameType::Login {
        return Err(SessionError::UnexpectedFrame(frame.fast.typ));
    }
    let meta = parse_meta(&frame.meta_raw)?;
    Ok(Login {
        user: get_meta_str(&meta, "user").ok_or(SessionError::MissingMeta("user"))?,
        password: get_meta_str(&meta, "password").ok_or(SessionError::MissingMeta("password"))?,
        module: get_meta_str(&meta, "module").unwrap_or_default(),
    })
}

/// Build the LOGIN_RESULT answering the LOGIN with id `corr_id`
pub fn build_login_result(msg_id: u64, corr_id: u64, result: &LoginResult) -> Result<Bytes, CodecError> {
    let builder = FrameBuilder::new(FastHeader::new(FrameType::LoginResult, msg_id))
        .flags(Flags::RESPONSE | Flags::HDR_CHECKSUM)
        .corr_id(corr_id);

    let builder = match result {
        LoginResult::Accepted { session_id } => builder
            .code(StatusCode::Ok)
            .meta_insert_str("session_id", session_id),
        LoginResult::Rejected { reason } => builder
            .code(StatusCode::Fatal)
            .meta_insert_str("reason", reason),
    };
    builder.build(MAX_CONTROL_FRAME)
}

/// Interpret a LOGIN_RESULT frame
pub fn parse_login_result(frame: &Frame) -> Result<LoginResult, SessionError> {
    if frame.fast.typ != FrameType::LoginResult {
        return Err(SessionError::UnexpectedFrame(frame.fast.typ));
    }
    let meta = parse_meta(&frame.meta_raw)?;
    match frame.fast.code {
        StatusCode::Ok => {
            let session_id = get_meta_str(&meta, "session_id").ok_or(SessionError::MissingMeta("session_id"))?;
            Ok(LoginResult::Accepted { session_id })
        }
        _ => Ok(LoginResult::Rejected {
            reason: get_meta_str(&meta, "reason").unwrap_or_default(),
        }),
    }
}

/// Client side: present `login` and wait for the verdict
pub async fn send_login(connector: &Connector, login: &Login) -> Result<LoginResult, SessionError> {
    let msg_id = connector.next_msg_id();
    connector.send_frame(&build_login(msg_id, login)?).await?;
    debug!("sent LOGIN for user {}", login.user);

    loop {
        let frame = connector.recv_frame().await?;
        match frame.fast.typ {
            FrameType::LoginResult => return parse_login_result(&frame),
            // The server may already be probing the link
            FrameType::Ping | FrameType::Pong => trace!("ignoring {:?} during login", frame.fast.typ),
            other => return Err(SessionError::UnexpectedFrame(other)),
        }
    }
}

/// Server side: wait for a LOGIN frame
pub async fn recv_login(connector: &Connector) -> Result<(Login, u64), SessionError> {
    let frame = connector.recv_frame().await?;
    let login = parse_login(&frame)?;
    trace!("received LOGIN from user {}", login.user);
    Ok((login, frame.fast.msg_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tunnel_wire::FrameDecoder;

    fn decode(bytes: Bytes) -> Frame {
        let mut buf = BytesMut::from(bytes.as_ref());
        FrameDecoder::new().decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_login_roundtrip() {
        let login = Login {
            user: "bob".to_string(),
            password: "secret".to_string(),
            module: "tunnel".to_string(),
        };
        let frame = decode(build_login(9, &login).unwrap());

        assert_eq!(frame.fast.typ, FrameType::Login);
        assert!(frame.fast.flags.contains(Flags::HDR_CHECKSUM));
        assert_eq!(parse_login(&frame).unwrap(), login);
    }

    #[test]
    fn test_login_result_variants() {
        let accepted = LoginResult::Accepted {
            session_id: "S1".to_string(),
        };
        let frame = decode(build_login_result(1, 9, &accepted).unwrap());
        assert_eq!(frame.fast.corr_id, 9);
        assert_eq!(frame.fast.code, StatusCode::Ok);
        assert_eq!(parse_login_result(&frame).unwrap(), accepted);

        let rejected = LoginResult::Rejected {
            reason: "bad credentials".to_string(),
        };
        let frame = decode(build_login_result(2, 9, &rejected).unwrap());
        assert_eq!(frame.fast.code, StatusCode::Fatal);
        assert_eq!(parse_login_result(&frame).unwrap(), rejected);
    }

    #[test]
    fn test_parse_login_rejects_other_frames() {
        let ping = decode(crate::keepalive::build_ping(1, 2).unwrap());
        assert!(matches!(
            parse_login(&ping),
            Err(SessionError::UnexpectedFrame(FrameType::Ping))
        ));
    }

    #[test]
    fn test_debug_hides_password() {
        let login = Login {
            user: "bob".to_string(),
            password: "secret".to_string(),
            module: String::new(),
        };
        assert!(!format!("{:?}", login).contains("secret"));
    }
}
