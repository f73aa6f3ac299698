pub mod clint;
pub mod plic;
pub mod sysinfo;
pub mod uart;

// D1 (Allwinner) compatible devices for unified kernel support
pub mod d1_mmc;
pub mod d1_display;
pub mod d1_emac;
pub mod d1_touch;
