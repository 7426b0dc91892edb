pub mod aws;
pub mod cloud;
pub mod manager;
pub mod plan;
pub mod registry;
pub mod resource;
pub mod state;
pub mod token;
