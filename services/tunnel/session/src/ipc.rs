//! IPC layer shared by session modules.
//!
//! A module publishes a list of objects (itself, its sessions, its listener)
//! that peers can query with an OBJECT_LIST request, and dispatches incoming
//! tunnel messages to handlers registered by wire name.

use crate::error::SessionError;
use crate::handshake::MAX_CONTROL_FRAME;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use tunnel_connector::{lock, Connector};
use tunnel_wire::{CodecError, FastHeader, Flags, Frame, FrameBuilder, FrameType, TunnelMessage};

/// Object published by a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcObject {
    /// Object name, unique within the module
    pub name: String,
    /// Publishing module
    pub module: String,
    /// Session the object belongs to, empty for module-wide objects
    pub session_id: String,
    /// Address associated with the object (listener or peer)
    pub address: Option<String>,
}

/// Handler invoked for a tunnel message
pub type SignalHandler = Arc<dyn Fn(&TunnelMessage) + Send + Sync>;

/// Routes tunnel messages to handlers registered by wire name
#[derive(Default)]
pub struct SignalDispatcher {
    handlers: Mutex<HashMap<String, Vec<SignalHandler>>>,
}

impl SignalDispatcher {
    /// Register `handler` for messages named `wire_name`
    pub fn register<F>(&self, wire_name: &str, handler: F)
    where
        F: Fn(&TunnelMessage) + Send + Sync + 'static,
    {
        lock(&self.handlers)
            .entry(wire_name.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Invoke every handler registered for the message; returns how many ran
    pub fn dispatch(&self, message: &TunnelMessage) -> usize {
        let handlers: Vec<SignalHandler> = lock(&self.handlers)
            .get(message.wire_name())
            .cloned()
            .unwrap_or_default();
        for handler in &handlers {
            handler(message);
        }
        handlers.len()
    }
}

impl std::fmt::Debug for SignalDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = lock(&self.handlers).keys().cloned().collect();
        f.debug_struct("SignalDispatcher").field("signals", &names).finish()
    }
}

/// Published objects, signal dispatch and object-list requests of one module
#[derive(Debug)]
pub struct IpcModule {
    name: String,
    objects: Mutex<Vec<IpcObject>>,
    dispatcher: SignalDispatcher,
    pending: Mutex<HashMap<u64, oneshot::Sender<Vec<IpcObject>>>>,
}

impl IpcModule {
    /// Module named `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Mutex::new(Vec::new()),
            dispatcher: SignalDispatcher::default(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Module name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish (or replace) an object named `name`
    pub fn publish(&self, name: &str, session_id: &str, address: Option<String>) {
        let object = IpcObject {
            name: name.to_string(),
            module: self.name.clone(),
            session_id: session_id.to_string(),
            address,
        };
        let mut objects = lock(&self.objects);
        objects.retain(|existing| existing.name != object.name);
        objects.push(object);
    }

    /// Withdraw the object named `name`
    pub fn unpublish(&self, name: &str) -> bool {
        let mut objects = lock(&self.objects);
        let before = objects.len();
        objects.retain(|existing| existing.name != name);
        objects.len() != before
    }

    /// Snapshot of the published objects
    pub fn objects(&self) -> Vec<IpcObject> {
        lock(&self.objects).clone()
    }

    /// Handler registry for incoming tunnel messages
    pub fn dispatcher(&self) -> &SignalDispatcher {
        &self.dispatcher
    }

    /// Build an OBJECT_LIST request
    pub fn build_object_list_request(msg_id: u64) -> Result<Bytes, CodecError> {
        FrameBuilder::new(FastHeader::new(FrameType::ObjectList, msg_id)).build(MAX_CONTROL_FRAME)
    }

    /// Build the OBJECT_LIST response carrying our published objects
    pub fn build_object_list_response(&self, msg_id: u64, corr_id: u64) -> Result<Bytes, CodecError> {
        let mut payload = Vec::new();
        ciborium::into_writer(&self.objects(), &mut payload)
            .map_err(|_| CodecError::PayloadEncode)?;

        FrameBuilder::new(FastHeader::new(FrameType::ObjectList, msg_id))
            .flags(Flags::RESPONSE)
            .corr_id(corr_id)
            .payload(Bytes::from(payload))
            .build(MAX_CONTROL_FRAME)
    }

    /// Decode the objects carried by an OBJECT_LIST response
    pub fn parse_object_list(frame: &Frame) -> Result<Vec<IpcObject>, SessionError> {
        if frame.payload.is_empty() {
            return Ok(Vec::new());
        }
        ciborium::from_reader(frame.payload.as_ref())
            .map_err(|_| SessionError::Codec(CodecError::PayloadDecode))
    }

    /// Ask the peer behind `connector` for its objects.
    ///
    /// The answer is delivered by the session driver through [`IpcModule::handle_frame`].
    pub async fn request_objects(&self, connector: &Connector, timeout: Duration) -> Result<Vec<IpcObject>, SessionError> {
        let msg_id = connector.next_msg_id();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(msg_id, tx);

        let result = async {
            connector.send_frame(&Self::build_object_list_request(msg_id)?).await?;
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(objects)) => Ok(objects),
                Ok(Err(_)) => Err(SessionError::Closed),
                Err(_) => Err(SessionError::Timeout("object list")),
            }
        }
        .await;

        lock(&self.pending).remove(&msg_id);
        result
    }

    /// Process a MESSAGE or OBJECT_LIST frame; returns a reply to send, if any
    pub fn handle_frame(&self, frame: &Frame, reply_msg_id: u64) -> Result<Option<Bytes>, SessionError> {
        match frame.fast.typ {
            FrameType::Message => {
                let message = TunnelMessage::from_frame(frame)?;
                let handled = self.dispatcher.dispatch(&message);
                if handled == 0 {
                    debug!("no handler for {}", message.wire_name());
                } else {
                    trace!("{} dispatched to {} handlers", message.wire_name(), handled);
                }
                Ok(None)
            }
            FrameType::ObjectList if frame.fast.flags.contains(Flags::RESPONSE) => {
                let objects = Self::parse_object_list(frame)?;
                match lock(&self.pending).remove(&frame.fast.corr_id) {
                    Some(waiter) => {
                        let _ = waiter.send(objects);
                    }
                    None => warn!("unsolicited object list (corr_id {})", frame.fast.corr_id),
                }
                Ok(None)
            }
            FrameType::ObjectList => {
                let reply = self.build_object_list_response(reply_msg_id, frame.fast.msg_id)?;
                Ok(Some(reply))
            }
            other => Err(SessionError::UnexpectedFrame(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tunnel_wire::{FrameDecoder, LISTENER_CREATED_WIRE_NAME};

    fn decode(bytes: Bytes) -> Frame {
        let mut buf = BytesMut::from(bytes.as_ref());
        FrameDecoder::new().decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_dispatch_by_wire_name() {
        let ipc = IpcModule::new("tunnel");
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            ipc.dispatcher().register(LISTENER_CREATED_WIRE_NAME, move |message| {
                assert_eq!(message.address().port, 5000);
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        let created = TunnelMessage::listener_created("L1", "S1", "10.0.0.1", 5000);
        let frame = decode(created.to_frame(1).unwrap());
        assert!(ipc.handle_frame(&frame, 2).unwrap().is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // The subtype has its own wire name and is not routed to the base handler
        let discovered = TunnelMessage::external_address_discovered("L1", "S1", "1.2.3.4", 6000);
        assert_eq!(ipc.dispatcher().dispatch(&discovered), 0);
    }

    #[test]
    fn test_object_list_request_is_answered() {
        let ipc = IpcModule::new("tunnel");
        ipc.publish("server", "", Some("0.0.0.0:7000".to_string()));
        ipc.publish("session", "S1", None);
        ipc.publish("server", "", Some("0.0.0.0:7001".to_string()));

        let request = decode(IpcModule::build_object_list_request(4).unwrap());
        let reply = ipc.handle_frame(&request, 10).unwrap().unwrap();
        let reply = decode(reply);
        assert!(reply.fast.flags.contains(Flags::RESPONSE));
        assert_eq!(reply.fast.corr_id, 4);

        let objects = IpcModule::parse_object_list(&reply).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[1].address.as_deref(), Some("0.0.0.0:7001"));
        assert!(objects.iter().all(|object| object.module == "tunnel"));

        assert!(ipc.unpublish("session"));
        assert!(!ipc.unpublish("session"));
    }

    #[test]
    fn test_response_resolves_pending_request() {
        let ipc = IpcModule::new("tunnel");
        let (tx, mut rx) = oneshot::channel();
        lock(&ipc.pending).insert(4, tx);

        let peer = IpcModule::new("peer");
        peer.publish("server", "", None);
        let response = decode(peer.build_object_list_response(1, 4).unwrap());

        assert!(ipc.handle_frame(&response, 2).unwrap().is_none());
        let objects = rx.try_recv().unwrap();
        assert_eq!(objects[0].module, "peer");
    }
}
