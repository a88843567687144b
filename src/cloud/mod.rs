// ABOUTME: Cloud-side services - the upstream session actor and the reachability prober
// ABOUTME: Exports the session handle, send outcomes and probe configuration

//! Cloud Session Module
//!
//! Owns everything that talks to the vendor cloud:
//!
//! * `session` - the single TCP session to the cloud endpoint. One owner
//!   task holds the socket; everyone else talks to it through a command
//!   channel, so sends are serialised and the cloud's in-order view is
//!   preserved.
//! * `probe` - the optional out-of-band reachability check with two-sided
//!   hysteresis. Disabled by default so stealth deployments emit no
//!   traffic the BOX didn't originate.
//!
//! The session never reconnects eagerly: a connect is only attempted when
//! something needs to be sent. The real cloud emits no keep-alives, and
//! unsolicited traffic from our side would betray the proxy's presence.

pub mod probe;
pub mod session;

pub use probe::{Hysteresis, ProbeConfig};
pub use session::{CloudSession, SendOutcome, SessionState};
