//! Upload handler: fetch a JSON document from the device, forward it upstream

use crate::error::HandlerError;
use crate::transport::DeviceTransport;
use crate::types::UploadResource;
use serde::de::IgnoredAny;
use std::net::IpAddr;
use tracing::debug;

pub async fn handle(
    transport: &dyn DeviceTransport,
    address: IpAddr,
    resource: UploadResource,
    upload_url: &str,
    device_name: &str,
) -> Result<(), HandlerError> {
    let body = transport.fetch_device_info(address, resource).await?;
    // The content type was checked, the body itself is checked here
    serde_json::from_slice::<IgnoredAny>(&body)?;
    debug!(
        address = %address,
        resource = resource.path(),
        bytes = body.len(),
        "Forwarding device info"
    );
    transport.forward_upload(upload_url, device_name, body).await?;
    Ok(())
}
