//! Messenger trait and its object-safe companion.

use crate::SenderKey;
use crate::error::DeliveryError;

use std::future::Future;
use std::pin::Pin;

/// Outbound delivery channel for one transport.
pub trait Messenger: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Show a typing indicator while a reply is produced. Best effort.
    fn send_typing(
        &self,
        _sender: &SenderKey,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send {
        async { Ok(()) }
    }

    /// Send reply text to `sender`.
    fn deliver(
        &self,
        sender: &SenderKey,
        text: &str,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

type DeliveryFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + 'a>>;

/// Object-safe companion of [`Messenger`], blanket-implemented for every
/// messenger.
pub trait MessengerDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn send_typing<'a>(&'a self, sender: &'a SenderKey) -> DeliveryFuture<'a>;

    fn deliver<'a>(&'a self, sender: &'a SenderKey, text: &'a str) -> DeliveryFuture<'a>;
}

impl<T: Messenger> MessengerDyn for T {
    fn name(&self) -> &str {
        Messenger::name(self)
    }

    fn send_typing<'a>(&'a self, sender: &'a SenderKey) -> DeliveryFuture<'a> {
        Box::pin(Messenger::send_typing(self, sender))
    }

    fn deliver<'a>(&'a self, sender: &'a SenderKey, text: &'a str) -> DeliveryFuture<'a> {
        Box::pin(Messenger::deliver(self, sender, text))
    }
}
