// NTLM credentials and challenge-response handling
use crate::config::UserConfig;
use crate::error::{ProxyError, Result};
use crate::http::ResponseHead;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use once_cell::sync::OnceCell;
use std::time::{SystemTime, UNIX_EPOCH};

// NTLMSSP negotiate flags
const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const OEM_DOMAIN_SUPPLIED: u32 = 0x0000_1000;
const OEM_WORKSTATION_SUPPLIED: u32 = 0x0000_2000;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSION_SECURITY: u32 = 0x0008_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

/// Seconds between the Windows epoch (1601) and the Unix epoch.
const FILETIME_UNIX_OFFSET: u64 = 11_644_473_600;

/// Upstream credentials, scope ANY authority. Immutable once materialized.
#[derive(Debug, Clone)]
pub struct NtlmCredentials {
    pub username: String,
    pub password: String,
    pub domain: String,
    pub workstation: Option<String>,
}

/// Lazily materializes the single [`NtlmCredentials`] instance of the
/// process from the user configuration.
pub struct CredentialsStore {
    user_config: UserConfig,
    provider: OnceCell<NtlmCredentials>,
}

impl CredentialsStore {
    pub fn new(user_config: UserConfig) -> Self {
        CredentialsStore {
            user_config,
            provider: OnceCell::new(),
        }
    }

    /// First call materializes the provider; later calls return the same
    /// instance. Fails before any socket is opened when required fields
    /// are missing.
    pub fn get(&self) -> Result<&NtlmCredentials> {
        self.provider.get_or_try_init(|| {
            let cfg = &self.user_config;
            if cfg.username.trim().is_empty() {
                return Err(ProxyError::Configuration("username is required".into()));
            }
            if cfg.password.is_empty() {
                return Err(ProxyError::Configuration("password is required".into()));
            }

            // Accept "DOMAIN\user" in the username field when no explicit
            // domain is configured.
            let (domain, username) = match cfg.username.split_once('\\') {
                Some((d, u)) if cfg.domain.trim().is_empty() => (d.to_string(), u.to_string()),
                _ => (cfg.domain.clone(), cfg.username.clone()),
            };

            Ok(NtlmCredentials {
                username,
                password: cfg.password.clone(),
                domain,
                workstation: None,
            })
        })
    }
}

/// Authentication progress over one upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unchallenged,
    ChallengeReceived,
    Handshake,
    Success,
    Failure,
}

/// Stateful NTLM exchange: produces the next `Proxy-Authorization` value
/// for each `Proxy-Authenticate` challenge until the handshake completes
/// or no further message can be produced.
pub struct NtlmSession<'a> {
    credentials: &'a NtlmCredentials,
    state: AuthState,
    sent_negotiate: bool,
    sent_authenticate: bool,
}

impl<'a> NtlmSession<'a> {
    pub fn new(credentials: &'a NtlmCredentials) -> Self {
        NtlmSession {
            credentials,
            state: AuthState::Unchallenged,
            sent_negotiate: false,
            sent_authenticate: false,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Feeds the NTLM token of a 407 challenge (empty for the bare `NTLM`
    /// offer) and returns the next header value, or `None` when the
    /// exchange is exhausted.
    pub fn respond(&mut self, challenge: &str) -> Result<Option<String>> {
        self.state = AuthState::ChallengeReceived;
        let token = challenge.trim();
        if token.is_empty() {
            if self.sent_negotiate {
                // Server restarted the handshake; give up rather than loop.
                self.state = AuthState::Failure;
                return Ok(None);
            }
            self.sent_negotiate = true;
            self.state = AuthState::Handshake;
            let message = negotiate_message(self.credentials);
            return Ok(Some(format!("NTLM {}", STANDARD.encode(message))));
        }

        if self.sent_authenticate {
            self.state = AuthState::Failure;
            return Ok(None);
        }
        let bytes = STANDARD.decode(token).map_err(|e| {
            ProxyError::UpstreamProtocol(format!("invalid NTLM challenge encoding: {e}"))
        })?;
        let challenge = parse_challenge(&bytes)?;
        let client_challenge: [u8; 8] = rand::random();
        let message = authenticate_message(
            self.credentials,
            &challenge,
            &client_challenge,
            filetime_now(),
        );
        self.sent_authenticate = true;
        self.state = AuthState::Handshake;
        Ok(Some(format!("NTLM {}", STANDARD.encode(message))))
    }

    pub fn succeed(&mut self) {
        self.state = AuthState::Success;
    }

    pub fn fail(&mut self) {
        self.state = AuthState::Failure;
    }
}

/// Extracts the NTLM token from a 407 response; `Some("")` for the bare
/// `Proxy-Authenticate: NTLM` offer, `None` when NTLM is not proposed.
pub fn ntlm_challenge(head: &ResponseHead) -> Option<String> {
    head.header_values("Proxy-Authenticate").find_map(|value| {
        let value = value.trim();
        if value.eq_ignore_ascii_case("NTLM") {
            return Some(String::new());
        }
        if value.len() > 4
            && value[..4].eq_ignore_ascii_case("NTLM")
            && value.as_bytes()[4].is_ascii_whitespace()
        {
            return Some(value[5..].trim().to_string());
        }
        None
    })
}

/// Builds the Type-1 negotiate message. Domain and workstation ride along
/// OEM-encoded when known.
pub fn negotiate_message(credentials: &NtlmCredentials) -> Vec<u8> {
    let domain = credentials.domain.to_uppercase();
    let workstation = credentials
        .workstation
        .clone()
        .unwrap_or_default()
        .to_uppercase();
    let domain_bytes = domain.as_bytes();
    let workstation_bytes = workstation.as_bytes();

    let mut flags = NEGOTIATE_UNICODE
        | REQUEST_TARGET
        | NEGOTIATE_NTLM
        | NEGOTIATE_ALWAYS_SIGN
        | NEGOTIATE_EXTENDED_SESSION_SECURITY
        | NEGOTIATE_128
        | NEGOTIATE_56;
    if !domain_bytes.is_empty() {
        flags |= OEM_DOMAIN_SUPPLIED;
    }
    if !workstation_bytes.is_empty() {
        flags |= OEM_WORKSTATION_SUPPLIED;
    }

    let payload_offset = 32u32;
    let workstation_offset = payload_offset;
    let domain_offset = payload_offset + workstation_bytes.len() as u32;

    let mut msg = Vec::with_capacity(32 + workstation_bytes.len() + domain_bytes.len());
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&1u32.to_le_bytes());
    msg.extend_from_slice(&flags.to_le_bytes());
    push_security_buffer(&mut msg, domain_bytes.len(), domain_offset);
    push_security_buffer(&mut msg, workstation_bytes.len(), workstation_offset);
    msg.extend_from_slice(workstation_bytes);
    msg.extend_from_slice(domain_bytes);
    msg
}

/// The server's Type-2 challenge, reduced to what the Type-3 computation
/// needs.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub flags: u32,
    pub server_challenge: [u8; 8],
    pub target_info: Vec<u8>,
}

pub fn parse_challenge(msg: &[u8]) -> Result<Challenge> {
    if msg.len() < 32 {
        return Err(ProxyError::UpstreamProtocol(
            "NTLM challenge message too short".into(),
        ));
    }
    if &msg[..8] != SIGNATURE {
        return Err(ProxyError::UpstreamProtocol(
            "NTLM challenge lacks NTLMSSP signature".into(),
        ));
    }
    if read_u32(msg, 8) != 2 {
        return Err(ProxyError::UpstreamProtocol(
            "NTLM message is not a Type-2 challenge".into(),
        ));
    }
    let flags = read_u32(msg, 20);
    let mut server_challenge = [0u8; 8];
    server_challenge.copy_from_slice(&msg[24..32]);

    let target_info = if msg.len() >= 48 {
        let len = read_u16(msg, 40) as usize;
        let offset = read_u32(msg, 44) as usize;
        if len > 0 {
            let end = offset.checked_add(len).filter(|end| *end <= msg.len());
            match end {
                Some(end) => msg[offset..end].to_vec(),
                None => {
                    return Err(ProxyError::UpstreamProtocol(
                        "NTLM challenge target info out of bounds".into(),
                    ))
                }
            }
        } else {
            Vec::new()
        }
    } else {
        Vec::new()
    };

    Ok(Challenge {
        flags,
        server_challenge,
        target_info,
    })
}

/// Builds the Type-3 authenticate message carrying the NTLMv2 responses.
pub fn authenticate_message(
    credentials: &NtlmCredentials,
    challenge: &Challenge,
    client_challenge: &[u8; 8],
    timestamp: u64,
) -> Vec<u8> {
    let (nt_response, lm_response) = ntlmv2_responses(
        credentials,
        &challenge.server_challenge,
        client_challenge,
        timestamp,
        &challenge.target_info,
    );

    let domain = utf16le(&credentials.domain);
    let user = utf16le(&credentials.username);
    let workstation = utf16le(credentials.workstation.as_deref().unwrap_or(""));

    let flags = NEGOTIATE_UNICODE
        | REQUEST_TARGET
        | NEGOTIATE_NTLM
        | NEGOTIATE_ALWAYS_SIGN
        | NEGOTIATE_EXTENDED_SESSION_SECURITY
        | NEGOTIATE_128
        | NEGOTIATE_56;

    let header_len = 64u32;
    let domain_offset = header_len;
    let user_offset = domain_offset + domain.len() as u32;
    let workstation_offset = user_offset + user.len() as u32;
    let lm_offset = workstation_offset + workstation.len() as u32;
    let nt_offset = lm_offset + lm_response.len() as u32;
    let session_key_offset = nt_offset + nt_response.len() as u32;

    let mut msg = Vec::with_capacity(session_key_offset as usize);
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&3u32.to_le_bytes());
    push_security_buffer(&mut msg, lm_response.len(), lm_offset);
    push_security_buffer(&mut msg, nt_response.len(), nt_offset);
    push_security_buffer(&mut msg, domain.len(), domain_offset);
    push_security_buffer(&mut msg, user.len(), user_offset);
    push_security_buffer(&mut msg, workstation.len(), workstation_offset);
    push_security_buffer(&mut msg, 0, session_key_offset);
    msg.extend_from_slice(&flags.to_le_bytes());
    msg.extend_from_slice(&domain);
    msg.extend_from_slice(&user);
    msg.extend_from_slice(&workstation);
    msg.extend_from_slice(&lm_response);
    msg.extend_from_slice(&nt_response);
    msg
}

/// NTLMv2 proof computation (MS-NLMP 3.3.2): returns the NT and LM
/// challenge responses.
fn ntlmv2_responses(
    credentials: &NtlmCredentials,
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
    timestamp: u64,
    target_info: &[u8],
) -> (Vec<u8>, Vec<u8>) {
    let nt_hash = nt_owf(&credentials.password);
    let v2_hash = nt_owf_v2(&nt_hash, &credentials.username, &credentials.domain);

    let blob = v2_blob(timestamp, client_challenge, target_info);
    let mut proof_input = Vec::with_capacity(8 + blob.len());
    proof_input.extend_from_slice(server_challenge);
    proof_input.extend_from_slice(&blob);
    let nt_proof = hmac_md5(&v2_hash, &proof_input);

    let mut nt_response = nt_proof.to_vec();
    nt_response.extend_from_slice(&blob);

    let mut lm_input = Vec::with_capacity(16);
    lm_input.extend_from_slice(server_challenge);
    lm_input.extend_from_slice(client_challenge);
    let mut lm_response = hmac_md5(&v2_hash, &lm_input).to_vec();
    lm_response.extend_from_slice(client_challenge);

    (nt_response, lm_response)
}

fn v2_blob(timestamp: u64, client_challenge: &[u8; 8], target_info: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[0x01, 0x01, 0x00, 0x00]);
    blob.extend_from_slice(&[0u8; 4]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0u8; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0u8; 4]);
    blob
}

fn nt_owf(password: &str) -> [u8; 16] {
    let digest = Md4::digest(utf16le(password));
    digest.into()
}

fn nt_owf_v2(nt_hash: &[u8; 16], username: &str, domain: &str) -> [u8; 16] {
    let identity = format!("{}{}", username.to_uppercase(), domain);
    hmac_md5(nt_hash, &utf16le(&identity))
}

fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut mac =
        <Hmac<Md5> as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn push_security_buffer(msg: &mut Vec<u8>, len: usize, offset: u32) {
    msg.extend_from_slice(&(len as u16).to_le_bytes());
    msg.extend_from_slice(&(len as u16).to_le_bytes());
    msg.extend_from_slice(&offset.to_le_bytes());
}

fn read_u16(msg: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([msg[offset], msg[offset + 1]])
}

fn read_u32(msg: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([msg[offset], msg[offset + 1], msg[offset + 2], msg[offset + 3]])
}

fn filetime_now() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => (elapsed.as_nanos() / 100) as u64 + FILETIME_UNIX_OFFSET * 10_000_000,
        Err(_) => 0,
    }
}
