pub mod hump;
pub mod parking;
pub mod pickup;
pub mod train_arrival;
pub mod transport;
pub mod workshop;
