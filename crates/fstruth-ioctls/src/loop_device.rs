//! Loop device ioctl wrappers.
//!
//! Test images are sparse files; the formatting toolchain and the kernel
//! mount code want block devices.  This module attaches image files to free
//! loop devices and releases them again.

#![allow(unsafe_code)]

use std::{
    fs::OpenOptions,
    io::{Error, Result},
    os::fd::{AsFd, AsRawFd, OwnedFd},
    path::{Path, PathBuf},
};

use rustix::ioctl::{ioctl, opcode, NoArg, Opcode, Setter};

/// Flags for loop device configuration.
pub mod flags {
    /// Read-only loop device.
    pub const LO_FLAGS_READ_ONLY: u32 = 1;
    /// Automatically detach on last close.
    pub const LO_FLAGS_AUTOCLEAR: u32 = 4;
    /// Allow partition scanning.
    pub const LO_FLAGS_PARTSCAN: u32 = 8;
    /// Use direct I/O.
    pub const LO_FLAGS_DIRECT_IO: u32 = 16;
}

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

// How often we retry when somebody else grabs the device we were handed.
const ATTACH_ATTEMPTS: usize = 8;

#[repr(C)]
#[derive(Default)]
struct LoopConfig {
    fd: u32,
    block_size: u32,
    info: LoopInfo64,
    reserved: [u64; 8],
}

#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    // HACK: default trait is only implemented up to [u8; 32]
    lo_file_name: ([u8; LO_NAME_SIZE / 2], [u8; LO_NAME_SIZE / 2]),
    lo_crypt_name: ([u8; LO_NAME_SIZE / 2], [u8; LO_NAME_SIZE / 2]),
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: ([0; LO_NAME_SIZE / 2], [0; LO_NAME_SIZE / 2]),
            lo_crypt_name: ([0; LO_NAME_SIZE / 2], [0; LO_NAME_SIZE / 2]),
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

// Custom ioctl for LOOP_CTL_GET_FREE which returns data in the return value
struct LoopCtlGetFree;

// Rustix seems to lack a built-in pattern for an ioctl that returns data by the syscall return
// value instead of the usual return-by-reference on the args parameter.  Bake our own.
unsafe impl rustix::ioctl::Ioctl for LoopCtlGetFree {
    type Output = std::ffi::c_int;

    const IS_MUTATING: bool = false;

    fn opcode(&self) -> rustix::ioctl::Opcode {
        LOOP_CTL_GET_FREE
    }

    fn as_ptr(&mut self) -> *mut std::ffi::c_void {
        std::ptr::null_mut()
    }

    unsafe fn output_from_ptr(
        out: rustix::ioctl::IoctlOutput,
        _ptr: *mut std::ffi::c_void,
    ) -> rustix::io::Result<std::ffi::c_int> {
        Ok(out)
    }
}

// The loop driver matches the bare command numbers, without size or direction bits.
const LOOP_CTL_GET_FREE: Opcode = opcode::none(0x4C, 0x82);
const LOOP_CLR_FD: Opcode = opcode::none(0x4C, 0x01);
const LOOP_CONFIGURE: Opcode = opcode::none(0x4C, 0x0A);

/// A loop device attached to a backing file.
///
/// The device stays attached for as long as this value lives.  Dropping it
/// detaches the device on a best-effort basis; call [`LoopDevice::detach`] to
/// observe errors.
#[derive(Debug)]
pub struct LoopDevice {
    number: u32,
    path: PathBuf,
    fd: Option<OwnedFd>,
}

impl LoopDevice {
    /// Attaches `backing` to a free, writable loop device.
    ///
    /// The device is configured with `LO_FLAGS_AUTOCLEAR` so the kernel
    /// releases it even if this process dies without running destructors.
    pub fn attach(backing: impl AsFd, block_size: u32) -> Result<LoopDevice> {
        Self::attach_with_flags(backing, flags::LO_FLAGS_AUTOCLEAR, block_size)
    }

    /// Attaches `backing` to a free loop device with custom flags.
    ///
    /// # Arguments
    /// * `backing` - File descriptor of the backing file
    /// * `lo_flags` - Loop device flags (see `flags` module)
    /// * `block_size` - Logical block size exposed by the device
    pub fn attach_with_flags(
        backing: impl AsFd,
        lo_flags: u32,
        block_size: u32,
    ) -> Result<LoopDevice> {
        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/loop-control")?;

        let mut last_err = Error::other("no free loop device");
        for _ in 0..ATTACH_ATTEMPTS {
            // Get a free loop device number
            let free: i32 = unsafe { ioctl(&control, LoopCtlGetFree) }.map_err(Error::other)?;
            if free < 0 {
                return Err(Error::other("no free loop device"));
            }

            let path = PathBuf::from(format!("/dev/loop{free}"));
            let loop_dev = OpenOptions::new().read(true).write(true).open(&path)?;

            let config = LoopConfig {
                fd: backing.as_fd().as_raw_fd() as u32,
                block_size,
                info: LoopInfo64 {
                    lo_flags,
                    ..Default::default()
                },
                reserved: [0; 8],
            };

            let configured = unsafe {
                ioctl(
                    &loop_dev,
                    Setter::<{ LOOP_CONFIGURE }, LoopConfig>::new(config),
                )
            };

            match configured {
                Ok(()) => {
                    return Ok(LoopDevice {
                        number: free as u32,
                        path,
                        fd: Some(loop_dev.into()),
                    })
                }
                // Somebody else claimed the device between GET_FREE and CONFIGURE.
                Err(rustix::io::Errno::BUSY) => {
                    last_err = Error::other(format!("{} busy", path.display()));
                }
                Err(e) => return Err(Error::other(e)),
            }
        }

        Err(last_err)
    }

    /// The device number (`N` in `/dev/loopN`).
    pub fn number(&self) -> u32 {
        self.number
    }

    /// The device node path, suitable for passing to mkfs or mount.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Detaches the backing file from the device.
    ///
    /// If the device is still in use (for example, mounted) the kernel defers
    /// the detach until the last user goes away.
    pub fn detach(mut self) -> Result<()> {
        self.clear()
    }

    fn clear(&mut self) -> Result<()> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };
        match unsafe { ioctl(&fd, NoArg::<{ LOOP_CLR_FD }>::new()) } {
            // ENXIO: already detached (autoclear beat us to it)
            Ok(()) | Err(rustix::io::Errno::NXIO) => Ok(()),
            Err(e) => Err(Error::other(e)),
        }
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        // Closing the fd triggers autoclear anyway; this just makes it prompt.
        if let Err(e) = self.clear() {
            log::warn!("cannot detach {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_attach_not_root() {
        let mut tf = NamedTempFile::new().unwrap();
        tf.write_all(&[0u8; 4096]).unwrap();
        tf.flush().unwrap();

        let file = std::fs::File::open(tf.path()).unwrap();
        let result = LoopDevice::attach(&file, 512);

        // Without root, we expect permission denied
        if !rustix::process::getuid().is_root() {
            assert!(result.is_err());
        }
    }

    #[test]
    fn test_attach_and_detach() {
        if !rustix::process::getuid().is_root() {
            return;
        }
        let tf = NamedTempFile::new().unwrap();
        tf.as_file().set_len(1024 * 1024).unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(tf.path())
            .unwrap();

        let Ok(dev) = LoopDevice::attach(&file, 512) else {
            // containers often lack /dev/loop-control
            return;
        };
        assert!(dev
            .path()
            .to_str()
            .unwrap()
            .ends_with(&dev.number().to_string()));
        dev.detach().unwrap();
    }

    #[test]
    fn test_drop_releases() {
        if !rustix::process::getuid().is_root() {
            return;
        }
        let tf = NamedTempFile::new().unwrap();
        tf.as_file().set_len(1024 * 1024).unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(tf.path())
            .unwrap();

        let Ok(dev) = LoopDevice::attach(&file, 512) else {
            return;
        };
        drop(dev);
        // the file can be attached again; a second clear is harmless
        let mut again = LoopDevice::attach(&file, 512).unwrap();
        again.clear().unwrap();
        again.clear().unwrap();
    }
}
