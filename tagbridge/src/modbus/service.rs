//! RTU server service.
//!
//! Only FC 0x03 (read holding registers) and FC 0x10 (write multiple
//! registers) are served; the device has never answered FC 0x06, and test
//! clients route single writes through FC 0x10 for that reason.

use std::future::Future;
use std::pin::Pin;

use tokio_modbus::server::rtu::Server;
use tokio_modbus::server::Service;
use tokio_modbus::{ExceptionCode, Request, Response, Slave, SlaveRequest};
use tokio_serial::SerialStream;
use tokio_util::sync::CancellationToken;

use super::exception_for;
use crate::fb::ControllerHandle;
use crate::tracing::prelude::*;

pub struct BridgeService {
    slave: Slave,
    controller: ControllerHandle,
}

impl BridgeService {
    pub fn new(slave: Slave, controller: ControllerHandle) -> Self {
        Self { slave, controller }
    }
}

impl Service for BridgeService {
    type Request = SlaveRequest<'static>;
    type Response = Option<Response>;
    type Exception = ExceptionCode;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Exception>> + Send>>;

    fn call(&self, request: Self::Request) -> Self::Future {
        let controller = self.controller.clone();
        let us = self.slave;
        Box::pin(async move {
            if Slave(request.slave) != us {
                // Not addressed to this device; stay silent on the bus.
                return Ok(None);
            }
            match request.request {
                Request::ReadHoldingRegisters(addr, count) => {
                    let words = controller
                        .read(addr, count)
                        .await
                        .map_err(exception_for)?;
                    Ok(Some(Response::ReadHoldingRegisters(words)))
                }
                Request::WriteMultipleRegisters(addr, values) => {
                    let count = values.len() as u16;
                    controller
                        .write(addr, values.into_owned())
                        .await
                        .map_err(exception_for)?;
                    Ok(Some(Response::WriteMultipleRegisters(addr, count)))
                }
                other => {
                    debug!("Refusing unsupported function: {:?}", other);
                    Err(ExceptionCode::IllegalFunction)
                }
            }
        })
    }
}

/// Run the RTU server on `port` until shutdown.
pub async fn serve(
    port: SerialStream,
    service: BridgeService,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let server = Server::new(port);
    tokio::select! {
        _ = shutdown.cancelled() => {
            info!("Modbus server shutting down");
            Ok(())
        }
        result = server.serve_forever(service) => {
            result?;
            Ok(())
        }
    }
}
