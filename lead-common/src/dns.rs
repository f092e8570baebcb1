//! Outbound HTTP clients that refuse to reach loopback, private or link-local hosts.
use std::error::Error as StdError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, io};

use futures::FutureExt;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::{header, redirect};
use tokio::task::spawn_blocking;
use url::{Host, Url};

pub struct NoPublicIPv4Error;

impl StdError for NoPublicIPv4Error {}
impl fmt::Display for NoPublicIPv4Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "No public IPv4 found for specified host")
    }
}
impl fmt::Debug for NoPublicIPv4Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "No public IPv4 found for specified host")
    }
}

type BoxError = Box<dyn StdError + Send + Sync>;

/// Trimmed down version of the unstable `IpAddr::is_global`.
pub fn is_global_ipv4(ip: &Ipv4Addr) -> bool {
    !(ip.octets()[0] == 0
        || ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_unspecified())
}

fn is_global_addr(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => is_global_ipv4(&ip),
        IpAddr::V6(_) => false,
    }
}

/// Whether a URL may be requested without resolving it first. IP literals bypass the
/// resolver, so they are checked here. IPv6 is not supported.
pub fn is_public_target(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => is_global_ipv4(&ip),
        Some(Host::Ipv6(_)) => false,
        Some(Host::Domain(_)) => true,
        None => false,
    }
}

/// Resolves through the system resolver, keeping only public IPv4 addresses.
pub struct PublicIPv4Resolver {}

impl Resolve for PublicIPv4Resolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolve_host = move || (name.as_str(), 0).to_socket_addrs();

        let future_result = spawn_blocking(resolve_host).map(|result| match result {
            Ok(Ok(all_addrs)) => {
                let filtered: Vec<SocketAddr> = all_addrs.filter(is_global_addr).collect();
                if filtered.is_empty() {
                    let err: BoxError = Box::new(NoPublicIPv4Error);
                    Err(err)
                } else {
                    let addrs: Addrs = Box::new(filtered.into_iter());
                    Ok(addrs)
                }
            }
            Ok(Err(err)) => {
                let err: BoxError = Box::new(err);
                Err(err)
            }
            Err(join_err) => {
                let err: BoxError = Box::new(io::Error::from(join_err));
                Err(err)
            }
        });

        Box::pin(future_result)
    }
}

/// True if `err` or any of its sources is a `T`.
pub fn is_error_source<T: StdError + 'static>(err: &(dyn StdError + 'static)) -> bool {
    if err.is::<T>() {
        return true;
    }
    match err.source() {
        None => false,
        Some(source) => is_error_source::<T>(source),
    }
}

/// A reqwest client with the lead pipeline's defaults. Unless `allow_internal_ips` is
/// set, hostnames resolve to public IPv4 addresses only and redirects to internal IP
/// literals are refused.
pub fn build_http_client(
    user_agent: &str,
    request_timeout: Duration,
    default_headers: header::HeaderMap,
    allow_internal_ips: bool,
) -> reqwest::Result<reqwest::Client> {
    let mut client_builder = reqwest::Client::builder()
        .default_headers(default_headers)
        .user_agent(user_agent)
        .timeout(request_timeout);

    if !allow_internal_ips {
        client_builder = client_builder
            .dns_resolver(Arc::new(PublicIPv4Resolver {}))
            .redirect(redirect::Policy::custom(|attempt| {
                if is_public_target(attempt.url()) {
                    attempt.follow()
                } else {
                    attempt.error(NoPublicIPv4Error)
                }
            }));
    }

    client_builder.build()
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_is_public_target() {
        let public = |s: &str| is_public_target(&Url::parse(s).unwrap());

        assert!(public("https://hooks.example.com/lead"));
        assert!(public("http://8.8.8.8/hook"));

        assert!(!public("http://127.0.0.1:8080/hook"));
        assert!(!public("http://169.254.169.254/latest/meta-data"));
        assert!(!public("http://10.0.0.5/hook"));
        assert!(!public("http://192.168.1.1/hook"));
        assert!(!public("http://0.0.0.0/hook"));
        assert!(!public("http://[::1]/hook"));
    }

    #[tokio::test]
    async fn test_resolver_denies_localhost() {
        let resolver = PublicIPv4Resolver {};
        match resolver.resolve(Name::from_str("localhost").unwrap()).await {
            Ok(_) => panic!("should have failed"),
            Err(err) => assert!(err.is::<NoPublicIPv4Error>()),
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("request failed")]
    struct RequestFailed(#[source] NoPublicIPv4Error);

    #[test]
    fn test_is_error_source_walks_the_chain() {
        assert!(is_error_source::<NoPublicIPv4Error>(&RequestFailed(
            NoPublicIPv4Error
        )));

        let unrelated = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(!is_error_source::<NoPublicIPv4Error>(&unrelated));
    }
}
