pub mod keygen;
pub mod seal;
