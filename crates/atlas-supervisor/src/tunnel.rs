/// Exposes a local port on a public URL.
///
/// Failures never affect the application's run state; the supervisor logs
/// them against the application and carries on.
#[async_trait::async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Opens a tunnel to `127.0.0.1:port` and returns its public URL.
    async fn connect(&self, port: u16) -> anyhow::Result<String>;

    async fn disconnect(&self, public_url: &str) -> anyhow::Result<()>;
}
