//! Health-check endpoint: a minimal HTTP/1 server answering liveness probes.
//!
//! `GET` on any path returns 200 with an empty body; other methods return
//! 405. With `secure_health_check` the same handler is served over TLS using
//! the server's loaded credentials.

use std::convert::Infallible;
use std::sync::Arc;

use http_body_util::Empty;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::config::TlsMaterial;
use crate::server::ServerError;

async fn handle(request: Request<Incoming>) -> Result<Response<Empty<Bytes>>, Infallible> {
    let status = if request.method() == Method::GET {
        StatusCode::OK
    } else {
        StatusCode::METHOD_NOT_ALLOWED
    };
    let mut response = Response::new(Empty::new());
    *response.status_mut() = status;
    Ok(response)
}

/// Build a TLS acceptor from the loaded PEM material.
pub(crate) fn tls_acceptor(tls: &TlsMaterial) -> Result<TlsAcceptor, ServerError> {
    let certs = rustls_pemfile::certs(&mut &tls.cert_chain[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ServerError::InvalidTlsMaterial(format!("cert chain: {err}")))?;
    if certs.is_empty() {
        return Err(ServerError::InvalidTlsMaterial(
            "cert chain contains no certificates".to_string(),
        ));
    }
    let key = rustls_pemfile::private_key(&mut &tls.private_key[..])
        .map_err(|err| ServerError::InvalidTlsMaterial(format!("private key: {err}")))?
        .ok_or_else(|| {
            ServerError::InvalidTlsMaterial("no private key found in PEM".to_string())
        })?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| ServerError::InvalidTlsMaterial(err.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accept loop for the health-check listener; runs until the shutdown signal.
pub(crate) async fn serve(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait_for(|&stop| stop) => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(err) => {
                warn!("health check accept failed: {err}");
                continue;
            }
        };
        debug!("health check connection from {peer}");
        let tls = tls.clone();
        tokio::spawn(async move {
            let result = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => {
                        hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service_fn(handle))
                            .await
                    }
                    Err(err) => {
                        debug!("health check TLS handshake failed: {err}");
                        return;
                    }
                },
                None => {
                    hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(handle))
                        .await
                }
            };
            if let Err(err) = result {
                debug!("health check connection error: {err}");
            }
        });
    }
    debug!("health check listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn probe(addr: std::net::SocketAddr, method: Method) -> StatusCode {
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        tokio::spawn(conn);
        let request = Request::builder()
            .method(method)
            .uri("/")
            .header(hyper::header::HOST, "localhost")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        response.status()
    }

    #[tokio::test]
    async fn get_returns_200_other_methods_405() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(serve(listener, None, rx));

        assert_eq!(probe(addr, Method::GET).await, StatusCode::OK);
        assert_eq!(
            probe(addr, Method::POST).await,
            StatusCode::METHOD_NOT_ALLOWED
        );

        tx.send_replace(true);
        task.await.unwrap();
    }

    #[test]
    fn tls_acceptor_from_generated_material() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        let material = TlsMaterial {
            cert_chain: cert.pem().into_bytes(),
            private_key: key_pair.serialize_pem().into_bytes(),
        };
        assert!(tls_acceptor(&material).is_ok());
    }

    #[test]
    fn tls_acceptor_rejects_garbage() {
        let material = TlsMaterial {
            cert_chain: b"not pem".to_vec(),
            private_key: b"not pem".to_vec(),
        };
        assert!(tls_acceptor(&material).is_err());
    }
}
