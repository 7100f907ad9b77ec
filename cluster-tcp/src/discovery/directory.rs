use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::warn;

use super::MemberDiscovery;

const DELIM: char = '#';

/// Discovery over a shared directory (NFS mount or similar): one empty
/// marker file per registered address, named `host#port`. Creating and
/// removing marker files is naturally idempotent, which is all the contract
/// asks for.
pub struct DirectoryDiscovery {
    dir: PathBuf,
}

impl DirectoryDiscovery {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, addr: &SocketAddr) -> PathBuf {
        self.dir.join(format!("{}{}{}", addr.ip(), DELIM, addr.port()))
    }

    fn parse(name: &str) -> Option<SocketAddr> {
        let (host, port) = name.split_once(DELIM)?;
        let ip = host.parse::<IpAddr>().ok()?;
        let port = port.parse::<u16>().ok()?;
        Some(SocketAddr::new(ip, port))
    }
}

#[async_trait]
impl MemberDiscovery for DirectoryDiscovery {
    async fn registered_addresses(&self) -> shared::Result<Vec<SocketAddr>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut addrs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            match Self::parse(&name) {
                Some(addr) => addrs.push(addr),
                None => warn!("skipping unparseable discovery entry: {}", name),
            }
        }
        Ok(addrs)
    }

    async fn register_addresses(&self, addrs: &[SocketAddr]) -> shared::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        for addr in addrs {
            tokio::fs::write(self.path_for(addr), b"").await?;
        }
        Ok(())
    }

    async fn unregister_addresses(&self, addrs: &[SocketAddr]) -> shared::Result<()> {
        for addr in addrs {
            match tokio::fs::remove_file(self.path_for(addr)).await {
                Ok(()) => {}
                // Someone else already removed it; that is fine.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
