//! Starting a kernel process from a kernelspec.
//!
//! Reserves five local ports, writes a connection file into the Jupyter
//! runtime directory and spawns the kernelspec's command against it. The
//! process is killed and the connection file removed when the
//! `LaunchedKernel` is dropped.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use jupyter_protocol::ConnectionInfo;
use log::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::kernelspec::Kernelspec;

pub struct LaunchedKernel {
    pub kernel_id: String,
    pub kernelspec: Kernelspec,
    pub connection_info: ConnectionInfo,
    pub connection_file: PathBuf,
    process: tokio::process::Child,
}

impl LaunchedKernel {
    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }

    /// Kill the process without waiting for a shutdown reply.
    pub async fn kill(&mut self) -> Result<()> {
        self.process.kill().await?;
        Ok(())
    }
}

impl Drop for LaunchedKernel {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.connection_file);
        info!("[launch] kernel {} dropped", self.kernel_id);
    }
}

/// Connection info for a fresh local kernel on reserved TCP ports.
pub async fn local_connection_info(kernel_name: &str) -> Result<ConnectionInfo> {
    let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
    let ports = runtimelib::peek_ports(ip, 5)
        .await
        .map_err(|e| Error::Transport(format!("cannot reserve ports: {}", e)))?;

    Ok(ConnectionInfo {
        transport: jupyter_protocol::connection_info::Transport::TCP,
        ip: ip.to_string(),
        stdin_port: ports[0],
        control_port: ports[1],
        hb_port: ports[2],
        shell_port: ports[3],
        iopub_port: ports[4],
        signature_scheme: "hmac-sha256".to_string(),
        key: Uuid::new_v4().to_string(),
        kernel_name: Some(kernel_name.to_string()),
    })
}

/// Read a connection file written by a running kernel.
pub async fn read_connection_info(path: &Path) -> Result<ConnectionInfo> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

/// Launch `kernelspec` with a new connection file.
///
/// `cwd` defaults to the home directory.
pub async fn launch_kernel(kernelspec: &Kernelspec, cwd: Option<&Path>) -> Result<LaunchedKernel> {
    let connection_info = local_connection_info(&kernelspec.name).await?;

    let runtime_dir = runtimelib::dirs::runtime_dir();
    tokio::fs::create_dir_all(&runtime_dir).await?;

    let kernel_id: String =
        petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
    let connection_file = runtime_dir.join(format!("runt-kernel-{}.json", kernel_id));

    tokio::fs::write(
        &connection_file,
        serde_json::to_string_pretty(&connection_info)?,
    )
    .await?;

    let cwd = cwd
        .map(Path::to_path_buf)
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir);

    info!(
        "[launch] Starting kernel {} ({}) at {:?}",
        kernelspec.name, kernel_id, connection_file
    );

    let mut cmd = kernelspec.command(&connection_file)?;
    cmd.current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let process = match cmd.kill_on_drop(true).spawn() {
        Ok(process) => process,
        Err(e) => {
            let _ = tokio::fs::remove_file(&connection_file).await;
            return Err(e.into());
        }
    };

    Ok(LaunchedKernel {
        kernel_id,
        kernelspec: kernelspec.clone(),
        connection_info,
        connection_file,
        process,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_connection_info() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("kernel-test.json");
        let info = local_connection_info("python3").await.unwrap();
        tokio::fs::write(&path, serde_json::to_string(&info).unwrap())
            .await
            .unwrap();

        let read = read_connection_info(&path).await.unwrap();
        assert_eq!(read.shell_port, info.shell_port);
        assert_eq!(read.kernel_name.as_deref(), Some("python3"));
    }

    #[tokio::test]
    async fn test_local_connection_info_uses_distinct_ports() {
        let info = local_connection_info("echo").await.unwrap();
        let mut ports = vec![
            info.stdin_port,
            info.control_port,
            info.hb_port,
            info.shell_port,
            info.iopub_port,
        ];
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 5);
    }
}
