//! The broker's reconcilers.
//!
//! [`advertisement::AdvertisementController`] keeps each cluster record's
//! derived fields and freshness honest; [`reservation::ReservationController`]
//! drives reservations through their lifecycle and does the capacity
//! accounting against advertisements.

pub mod advertisement;
pub mod reservation;
