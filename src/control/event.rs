//! calloop integration for page flip delivery.

use std::io;
use std::sync::Arc;

use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use tracing::trace;

use super::FlipEvent;
use crate::device::KmsDevice;

/// [`EventSource`] draining page flip events of one device.
///
/// Events are fed into the device's commit bookkeeping first (waking up
/// the pipelines that wait on them) and then handed to the callback.
#[derive(Debug)]
pub struct DeviceEventSource {
    device: Arc<KmsDevice>,
    token: Option<Token>,
}

impl DeviceEventSource {
    /// Create an event source for `device`.
    ///
    /// Fails when the device collaborator exposes no pollable fd.
    pub fn new(device: Arc<KmsDevice>) -> io::Result<Self> {
        if device.control().poll_fd().is_none() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "device has no pollable fd",
            ));
        }
        Ok(DeviceEventSource {
            device,
            token: None,
        })
    }
}

impl EventSource for DeviceEventSource {
    type Event = FlipEvent;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(&mut self, _: Readiness, token: Token, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut ()) -> Self::Ret,
    {
        if Some(token) != self.token {
            return Ok(PostAction::Continue);
        }

        let events = self
            .device
            .control()
            .receive_events()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        for event in events {
            trace!(crtc = ?event.crtc, "page flip event");
            self.device.dispatch_event(event);
            callback(event, &mut ());
        }
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.token = Some(factory.token());
        let fd = self
            .device
            .control()
            .poll_fd()
            .expect("checked at construction");
        // Safety: the fd stays open for the lifetime of the Arc'd device
        unsafe { poll.register(fd, Interest::READ, Mode::Level, self.token.unwrap()) }
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.token = Some(factory.token());
        let fd = self
            .device
            .control()
            .poll_fd()
            .expect("checked at construction");
        poll.reregister(fd, Interest::READ, Mode::Level, self.token.unwrap())
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.token = None;
        let fd = self
            .device
            .control()
            .poll_fd()
            .expect("checked at construction");
        poll.unregister(fd)
    }
}
