//! Heartbeat handler

use crate::error::HandlerError;
use crate::transport::DeviceTransport;
use std::net::IpAddr;
use tracing::debug;

pub async fn handle(
    transport: &dyn DeviceTransport,
    address: IpAddr,
    content: &str,
) -> Result<(), HandlerError> {
    debug!(address = %address, "Handling heartbeat");
    transport.send_heartbeat(address, content).await?;
    Ok(())
}
