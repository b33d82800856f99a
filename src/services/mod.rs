pub mod convert_service;
pub mod naming;
pub mod storage;
pub mod transcoder;
