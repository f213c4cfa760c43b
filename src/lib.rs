#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod data;
pub mod encoder;
pub mod eval;
pub mod joint;
pub mod loss;
pub mod matchmap;
pub mod metrics;
pub mod model;
pub mod runlog;
pub mod training;
pub mod vocab;
