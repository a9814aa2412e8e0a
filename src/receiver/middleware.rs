//! Request guards of the HTTP entry point.
//!
//! Applied outermost first: trusted-subnet check, gzip inflation, HMAC
//! verification with response signing, body decryption. The HMAC covers the
//! body as sent, which is the ciphertext when encryption is on.

use super::http::ApiError;
use crate::core::{Result, ServerConfig, TallyError};
use crate::security::{Decryptor, Signer, TrustedSubnet, HASH_HEADER, HASH_METADATA, REAL_IP_HEADER};
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use flate2::read::GzDecoder;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Largest request body accepted, after inflation.
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Keys and filters shared by the HTTP and RPC entry points.
#[derive(Debug, Clone, Default)]
pub struct SecurityState {
    /// HMAC signer; disabled without a key
    pub signer: Signer,
    /// Body decryption; `None` passes bodies through
    pub decryptor: Option<Arc<Decryptor>>,
    /// Peer admission filter
    pub acl: TrustedSubnet,
}

impl SecurityState {
    /// Load keys and filters from the server configuration.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let decryptor = match &config.crypto_key {
            Some(path) => Some(Arc::new(Decryptor::from_file(path)?)),
            None => None,
        };
        Ok(Self {
            signer: Signer::new(config.key.as_deref()),
            decryptor,
            acl: TrustedSubnet::new(config.trusted_subnet.as_deref()),
        })
    }
}

async fn read_body(body: Body) -> std::result::Result<Bytes, Response> {
    axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError(TallyError::BadRequest(format!("unreadable body: {e}"))).into_response())
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|enc| enc.trim().eq_ignore_ascii_case("gzip")))
}

fn inflate(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(compressed)
        .take(MAX_BODY_BYTES as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| TallyError::BadRequest(format!("invalid gzip body: {e}")))?;
    if out.len() > MAX_BODY_BYTES {
        return Err(TallyError::BadRequest("inflated body too large".to_string()));
    }
    Ok(out)
}

/// Reject peers outside the trusted subnet, read from `X-Real-IP`.
pub async fn check_trusted_subnet(
    State(security): State<Arc<SecurityState>>,
    request: Request,
    next: Next,
) -> Response {
    let real_ip = request
        .headers()
        .get(REAL_IP_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = security.acl.check_header(real_ip) {
        warn!(uri = %request.uri(), "Request rejected by subnet filter: {}", e);
        return ApiError(e).into_response();
    }
    next.run(request).await
}

/// Inflate `Content-Encoding: gzip` request bodies.
pub async fn decompress_gzip(request: Request, next: Next) -> Response {
    if !is_gzip(request.headers()) {
        return next.run(request).await;
    }
    let (mut parts, body) = request.into_parts();
    let compressed = match read_body(body).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };
    let inflated = match inflate(&compressed) {
        Ok(bytes) => bytes,
        Err(e) => return ApiError(e).into_response(),
    };
    debug!(compressed = compressed.len(), inflated = inflated.len(), "Inflated request body");

    parts.headers.remove(header::CONTENT_ENCODING);
    parts.headers.remove(header::CONTENT_LENGTH);
    next.run(Request::from_parts(parts, Body::from(inflated))).await
}

/// Verify the `HashSHA256` header and sign the response body.
pub async fn verify_and_sign(
    State(security): State<Arc<SecurityState>>,
    request: Request,
    next: Next,
) -> Response {
    if !security.signer.is_enabled() {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let bytes = match read_body(body).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };
    let signature = parts.headers.get(HASH_HEADER).and_then(|v| v.to_str().ok());
    if let Err(e) = security.signer.verify(&bytes, signature) {
        warn!(uri = %parts.uri, "Rejected request with bad signature");
        return ApiError(e).into_response();
    }

    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;
    sign_response(&security.signer, response).await
}

async fn sign_response(signer: &Signer, response: Response) -> Response {
    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to buffer response for signing: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        },
    };
    if let Some(signature) = signer.sign(&bytes) {
        if let Ok(value) = HeaderValue::from_str(&signature) {
            parts.headers.insert(HeaderName::from_static(HASH_METADATA), value);
        }
    }
    Response::from_parts(parts, Body::from(bytes))
}

/// Decrypt the request body with the server's private key.
pub async fn decrypt_body(
    State(security): State<Arc<SecurityState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(decryptor) = security.decryptor.clone() else {
        return next.run(request).await;
    };

    let (mut parts, body) = request.into_parts();
    let ciphertext = match read_body(body).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };
    if ciphertext.is_empty() {
        return next.run(Request::from_parts(parts, Body::empty())).await;
    }

    let decrypted = tokio::task::spawn_blocking(move || decryptor.decrypt(&ciphertext)).await;
    let plaintext = match decrypted {
        Ok(Ok(plaintext)) => plaintext,
        Ok(Err(e)) => {
            warn!(uri = %parts.uri, "Failed to decrypt request body: {}", e);
            return ApiError(TallyError::BadRequest(e.to_string())).into_response();
        },
        Err(e) => return ApiError(TallyError::from(e)).into_response(),
    };

    parts.headers.remove(header::CONTENT_LENGTH);
    next.run(Request::from_parts(parts, Body::from(plaintext))).await
}
