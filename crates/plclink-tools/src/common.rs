use clap::Args;
use plclink_client::{ClientError, ClientSettings, EchoPolicy, ModbusClient};
use plclink_datalink::ModbusTcpTransport;
use std::time::Duration;

#[derive(Debug, Clone, Args)]
pub struct TcpConnectionArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 502)]
    pub port: u16,
    #[arg(long, default_value_t = 1)]
    pub unit_id: u8,
    /// Request timeout in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub timeout: u64,
    /// Connect timeout in milliseconds.
    #[arg(long, default_value_t = 3000)]
    pub connect_timeout: u64,
    /// Fail writes whose echo differs from the request.
    #[arg(long)]
    pub strict_echo: bool,
}

impl TcpConnectionArgs {
    pub fn settings(&self) -> ClientSettings {
        let echo_policy = if self.strict_echo {
            EchoPolicy::Reject
        } else {
            EchoPolicy::Warn
        };
        ClientSettings::new(self.host.clone(), self.port)
            .with_unit_id(self.unit_id)
            .with_request_timeout(Duration::from_millis(self.timeout))
            .with_connect_timeout(Duration::from_millis(self.connect_timeout))
            .with_echo_policy(echo_policy)
    }
}

/// Build a client for `args` and bring its link up.
pub async fn connect_client(
    args: &TcpConnectionArgs,
) -> Result<ModbusClient<ModbusTcpTransport>, ClientError> {
    let client = ModbusClient::with_settings(ModbusTcpTransport::new(), args.settings());
    client.connect().await?;
    Ok(client)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::TcpConnectionArgs;
    use clap::Parser;
    use plclink_client::EchoPolicy;
    use std::time::Duration;

    #[derive(Debug, Parser)]
    struct Cli {
        #[command(flatten)]
        conn: TcpConnectionArgs,
    }

    #[test]
    fn defaults_map_onto_client_settings() {
        let cli = Cli::try_parse_from(["tool"]).unwrap();
        let settings = cli.conn.settings();
        assert_eq!(settings.host, "127.0.0.1");
        assert_eq!(settings.port, 502);
        assert_eq!(settings.unit_id, 1);
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
        assert_eq!(settings.connect_timeout, Duration::from_secs(3));
        assert_eq!(settings.echo_policy, EchoPolicy::Warn);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "tool",
            "--host",
            "192.168.0.10",
            "--port",
            "1502",
            "--unit-id",
            "3",
            "--timeout",
            "250",
            "--connect-timeout",
            "750",
            "--strict-echo",
        ])
        .unwrap();
        let settings = cli.conn.settings();
        assert_eq!(settings.host, "192.168.0.10");
        assert_eq!(settings.port, 1502);
        assert_eq!(settings.unit_id, 3);
        assert_eq!(settings.request_timeout, Duration::from_millis(250));
        assert_eq!(settings.connect_timeout, Duration::from_millis(750));
        assert_eq!(settings.echo_policy, EchoPolicy::Reject);
    }
}
