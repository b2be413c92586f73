//! SMTP server module

mod session;
mod tls;

pub(crate) use session::{SessionHost, SmtpSession};
pub use tls::create_tls_acceptor;
