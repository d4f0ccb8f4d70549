pub mod approval;
pub mod history;
pub mod request;
