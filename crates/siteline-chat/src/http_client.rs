use reqwest::Client;
use url::{Host, Url};

use crate::error::Result;

const DISABLE_SYSTEM_PROXY_ENV: &str = "SITELINE_DISABLE_SYSTEM_PROXY";

pub(crate) fn build_http_client(base_url: &Url) -> Result<Client> {
    if should_disable_system_proxy(base_url) {
        Ok(Client::builder().no_proxy().build()?)
    } else {
        Ok(Client::new())
    }
}

fn should_disable_system_proxy(base_url: &Url) -> bool {
    if std::env::var_os(DISABLE_SYSTEM_PROXY_ENV).is_some() {
        return true;
    }

    // A backend on this machine never goes through the system proxy.
    match base_url.host() {
        Some(Host::Domain(domain)) => domain == "localhost",
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}
