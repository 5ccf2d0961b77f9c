//! Server-side TLS material.
//!
//! The acceptor is built once at startup so that a bad certificate or key
//! stops the process before it listens, rather than failing the first
//! STARTTLS.

use std::{io::BufReader, sync::Arc};

use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer},
        ServerConfig,
    },
    TlsAcceptor,
};

use crate::{
    config::{PemSource, TlsMaterial},
    error::{TlsError, TlsResult},
};

/// Raw PEM bytes for a source. Inline values given through a single-line
/// environment variable may carry literal `\n` sequences instead of newlines.
fn pem_bytes(source: &PemSource) -> std::io::Result<Vec<u8>> {
    match source {
        PemSource::Path(path) => std::fs::read(path),
        PemSource::Inline(pem) if !pem.contains('\n') => {
            Ok(pem.replace("\\n", "\n").into_bytes())
        }
        PemSource::Inline(pem) => Ok(pem.clone().into_bytes()),
    }
}

fn load_certs(source: &PemSource) -> TlsResult<Vec<CertificateDer<'static>>> {
    let failed = |reason: String| TlsError::CertificateLoad {
        source_name: source.to_string(),
        reason,
    };

    let pem = pem_bytes(source).map_err(|err| failed(err.to_string()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| failed(err.to_string()))?;

    if certs.is_empty() {
        return Err(failed("No certificates found".to_string()));
    }

    Ok(certs)
}

fn load_key(source: &PemSource) -> TlsResult<PrivateKeyDer<'static>> {
    let failed = |reason: String| TlsError::KeyLoad {
        source_name: source.to_string(),
        reason,
    };

    let pem = pem_bytes(source).map_err(|err| failed(err.to_string()))?;
    let mut reader = BufReader::new(pem.as_slice());

    loop {
        match rustls_pemfile::read_one(&mut reader).map_err(|err| failed(err.to_string()))? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(PrivateKeyDer::Sec1(key)),
            // Certificates bundled in the same file
            Some(_) => {}
            None => {
                return Err(failed(
                    "Unable to determine key format (expected PKCS1, PKCS8, or SEC1)".to_string(),
                ))
            }
        }
    }
}

/// Build the acceptor for STARTTLS and implicit TLS.
///
/// # Errors
/// If either half of the material is missing or unusable
pub fn acceptor(material: &TlsMaterial) -> TlsResult<TlsAcceptor> {
    let (Some(cert), Some(key)) = (material.cert.as_ref(), material.key.as_ref()) else {
        return Err(TlsError::NotConfigured);
    };

    let certs = load_certs(cert)?;
    let key = load_key(key)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Self-signed `localhost` material under `tests/fixtures`.
#[cfg(test)]
pub(crate) fn fixture() -> TlsMaterial {
    let path = |name: &str| {
        PemSource::Path(format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR")).into())
    };

    TlsMaterial {
        cert: Some(path("localhost.crt")),
        key: Some(path("localhost.key")),
    }
}
