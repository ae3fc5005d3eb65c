//! Application-facing callback surface.

use std::net::SocketAddr;

use crate::connection::Conn;

/// TCP event hooks.
///
/// One handler instance is shared by every thread in the runtime; per
/// connection state lives in the associated `Ctx`, constructed by
/// [`on_connect`](Handler::on_connect) and dropped after
/// [`on_close`](Handler::on_close) returns.
///
/// `HANDLES_READ` / `HANDLES_WRITE` declare which event kinds the handler
/// wants dispatched. When an event of an undeclared kind fires, the I/O loop
/// rearms the declared interest instead of staging a task; if neither is
/// declared every readiness event closes the connection.
///
/// Readiness is one-shot: a read or write callback must finish by calling
/// exactly one of [`Conn::enable_events`] (or [`Conn::renable_events`]) and
/// [`Conn::close`]. Calling both races the rearm against destruction;
/// calling neither parks the connection forever.
pub trait Handler: Send + Sync + 'static {
    /// Per-connection application state.
    type Ctx: Send + 'static;

    /// Whether read events should be dispatched to [`on_read`](Handler::on_read).
    const HANDLES_READ: bool = true;
    /// Whether write events should be dispatched to [`on_write`](Handler::on_write).
    const HANDLES_WRITE: bool = false;

    /// A connection was accepted. Returns its context.
    fn on_connect(&self, peer: SocketAddr) -> Self::Ctx;

    /// The read watermark was satisfied; bytes are waiting in the read ring.
    fn on_read(&self, conn: &Conn<Self::Ctx>, ctx: &mut Self::Ctx) {
        let _ = (conn, ctx);
    }

    /// The write ring drained below the watermark; the socket accepts data.
    fn on_write(&self, conn: &Conn<Self::Ctx>, ctx: &mut Self::Ctx) {
        let _ = (conn, ctx);
    }

    /// The connection is being torn down. `ctx` is dropped afterwards.
    fn on_close(&self, conn: &Conn<Self::Ctx>, ctx: &mut Self::Ctx) {
        let _ = (conn, ctx);
    }
}
