//! Low-level ioctl wrappers used by fstruth.
//!
//! The test-image generator attaches its sparse image files to loop devices so
//! the formatting toolchain and the kernel see real block devices:
//!
//! - **Loop device ioctls**: allocate, configure and release loop devices
//!   (behind the `loop-device` feature)
//!
//! # Safety
//!
//! All unsafe ioctl code is contained within this crate, allowing the core
//! crate to keep `unsafe_code` denied.
//!
//! # Example
//!
//! ```ignore
//! use fstruth_ioctls::loop_device::LoopDevice;
//!
//! let image = std::fs::OpenOptions::new().read(true).write(true).open("disk.img")?;
//! let dev = LoopDevice::attach(&image, 512)?;
//! println!("attached to {}", dev.path().display());
//! dev.detach()?;
//! ```

#![deny(unsafe_code)]

#[cfg(feature = "loop-device")]
pub mod loop_device;
