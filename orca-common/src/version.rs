/// SSH version string advertised by the gateway listener.
pub fn ssh_server_id() -> String {
    format!("SSH-2.0-orca_{}", env!("CARGO_PKG_VERSION"))
}
