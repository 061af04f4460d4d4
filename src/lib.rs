#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod model;
pub mod ode;
pub mod optim;
pub mod training;
pub mod viz;
