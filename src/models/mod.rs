pub mod booking;
pub mod payment;

pub use booking::{Booking, BookingStatus, StatusChange};
pub use payment::{AttemptStatus, Gateway, PaymentAttempt};
