//! Remote block devices for `rdd`
//!
//! A remote endpoint is named by a URL. `nbd://host[:port]/export` is served by the NBD client in
//! [`nbd`]; anything else containing `://` is rejected, and everything without a scheme is a local
//! path.

use anyhow::{anyhow, Context};
use tracing::instrument;

pub mod nbd;
pub mod protocol;

pub use nbd::NbdTarget;

/// Address of an NBD export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUrl {
    pub host: String,
    pub port: u16,
    pub export: String,
}

impl std::fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "nbd://[{}]:{}/{}", self.host, self.port, self.export)
        } else {
            write!(f, "nbd://{}:{}/{}", self.host, self.port, self.export)
        }
    }
}

impl std::str::FromStr for TargetUrl {
    type Err = anyhow::Error;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let Some((scheme, rest)) = url.split_once("://") else {
            return Err(anyhow!("{:?} is not a URL", url));
        };
        match scheme {
            "nbd" => {}
            "iscsi" => {
                return Err(anyhow!(
                    "iSCSI targets are not supported, export the LUN over NBD and use \
                    nbd://host[:port]/export instead"
                ));
            }
            other => return Err(anyhow!("unsupported target scheme {:?}", other)),
        }
        let (authority, export) = rest.split_once('/').unwrap_or((rest, ""));
        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| anyhow!("unterminated IPv6 address in {:?}", url))?;
            (host, after.strip_prefix(':'))
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };
        if host.is_empty() {
            return Err(anyhow!("missing host in {:?}", url));
        }
        let port = match port {
            Some(port) => port
                .parse()
                .with_context(|| format!("invalid port in {url:?}"))?,
            None => protocol::DEFAULT_PORT,
        };
        Ok(Self {
            host: host.to_string(),
            port,
            export: export.to_string(),
        })
    }
}

/// Whether a command line endpoint names a remote target rather than a local path.
#[must_use]
pub fn is_remote(endpoint: &str) -> bool {
    endpoint.contains("://")
}

#[instrument]
pub async fn connect(url: &str) -> anyhow::Result<NbdTarget> {
    let url: TargetUrl = url.parse()?;
    let target = NbdTarget::connect(url).await?;
    Ok(target)
}
