//! Native Laghos mesh reader adapter (feature `mfem`).
//!
//! Links against `libmfem-utils`, which walks an MFEM mesh together with its
//! energy, density and velocity grid functions and emits one point per
//! element vertex. The native reader only ever returns whole elements.
//!
//! The native read call reports both end-of-mesh and internal failures as a
//! zero count. This adapter separates them with `mfem_laghos_mesh_at_end`.

use std::ffi::CString;
use std::path::Path;

use libc::{c_char, c_int, size_t};

use crate::error::{IndexError, Result};
use crate::record::{PointRecord, RECORD_SIZE};
use crate::source::{Fetch, LaghosFiles, MeshSource, SourcePosition};

/// Native point layout (`laghos_mesh_point_t`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct LaghosMeshPoint {
    x: f64,
    y: f64,
    z: f64,
    e: f64,
    rho: f64,
    v_x: f64,
    v_y: f64,
    v_z: f64,
    element_id: size_t,
}

#[link(name = "mfem-utils")]
extern "C" {
    fn mfem_laghos_mesh_open(
        mesh_file: *const c_char,
        e_gf_file: *const c_char,
        rho_gf_file: *const c_char,
        v_gf_file: *const c_char,
    ) -> c_int;
    fn mfem_laghos_mesh_close(handle: c_int) -> c_int;
    fn mfem_laghos_mesh_read(
        handle: c_int,
        cur: *mut size_t,
        points: *mut LaghosMeshPoint,
        npoints: size_t,
    ) -> c_int;
    fn mfem_laghos_mesh_at_end(handle: c_int, cur: *const size_t) -> c_int;
    fn mfem_laghos_mesh_get_num_elements(handle: c_int) -> size_t;
    fn mfem_laghos_mesh_get_num_points(handle: c_int) -> size_t;
}

fn c_path(path: &Path) -> Result<CString> {
    let invalid = |reason: &str| IndexError::SourceOpen {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let s = path.to_str().ok_or_else(|| invalid("path is not valid UTF-8"))?;
    CString::new(s).map_err(|_| invalid("path contains a NUL byte"))
}

/// Mesh source backed by the native MFEM reader.
pub struct LaghosSource {
    handle: Option<c_int>,
    /// Aligned staging area for the native writer.
    staging: Vec<LaghosMeshPoint>,
}

impl LaghosSource {
    /// Open a Laghos dataset.
    pub fn open(files: &LaghosFiles) -> Result<Self> {
        files.check_exist()?;
        let mesh = c_path(&files.mesh)?;
        let e = c_path(&files.e)?;
        let rho = c_path(&files.rho)?;
        let v = c_path(&files.v)?;

        // SAFETY: all pointers are valid NUL-terminated strings for the call.
        let handle =
            unsafe { mfem_laghos_mesh_open(mesh.as_ptr(), e.as_ptr(), rho.as_ptr(), v.as_ptr()) };
        if handle < 0 {
            return Err(IndexError::SourceOpen {
                path: files.mesh.clone(),
                reason: format!("native reader returned handle {}", handle),
            });
        }
        tracing::debug!(handle, mesh = %files.mesh.display(), "opened Laghos mesh");

        Ok(Self {
            handle: Some(handle),
            staging: Vec::new(),
        })
    }
}

impl MeshSource for LaghosSource {
    fn read_batch(&mut self, at: SourcePosition, out: &mut [u8]) -> Fetch {
        let Some(handle) = self.handle else {
            return Fetch::Error(IndexError::SourceRead("mesh is closed".to_string()));
        };
        let capacity = out.len() / RECORD_SIZE;
        self.staging.resize(capacity, LaghosMeshPoint::default());

        let mut cur = at.raw() as size_t;
        // SAFETY: staging holds `capacity` initialized points; `cur` is a local.
        let count = unsafe {
            mfem_laghos_mesh_read(handle, &mut cur, self.staging.as_mut_ptr(), capacity)
        };

        if count < 0 {
            return Fetch::Error(IndexError::SourceRead(format!(
                "native read failed with status {}",
                count
            )));
        }
        if count == 0 {
            return if self.at_end(at) {
                Fetch::EndOfStream
            } else {
                Fetch::Error(IndexError::SourceRead(format!(
                    "native reader returned no points at element {} before end of mesh",
                    at.raw()
                )))
            };
        }

        let count = count as usize;
        if count > capacity {
            return Fetch::Error(IndexError::SourceRead(format!(
                "native reader returned {} points for a buffer of {}",
                count, capacity
            )));
        }
        for (point, slot) in self.staging[..count]
            .iter()
            .zip(out.chunks_exact_mut(RECORD_SIZE))
        {
            let record = PointRecord {
                x: point.x,
                y: point.y,
                z: point.z,
                e: point.e,
                rho: point.rho,
                v_x: point.v_x,
                v_y: point.v_y,
                v_z: point.v_z,
                element_id: point.element_id as u64,
            };
            slot.copy_from_slice(&record.encode());
        }

        Fetch::MoreData {
            count,
            next: SourcePosition::new(cur as u64),
        }
    }

    fn at_end(&self, at: SourcePosition) -> bool {
        match self.handle {
            Some(handle) => {
                let cur = at.raw() as size_t;
                // SAFETY: `cur` outlives the call.
                unsafe { mfem_laghos_mesh_at_end(handle, &cur) != 0 }
            }
            None => true,
        }
    }

    fn num_elements(&self) -> Option<u64> {
        let handle = self.handle?;
        // SAFETY: handle came from a successful open.
        let n = unsafe { mfem_laghos_mesh_get_num_elements(handle) };
        (n > 0).then_some(n as u64)
    }

    fn num_points(&self) -> Option<u64> {
        let handle = self.handle?;
        // SAFETY: handle came from a successful open.
        let n = unsafe { mfem_laghos_mesh_get_num_points(handle) };
        (n > 0).then_some(n as u64)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            // SAFETY: handle is closed exactly once.
            let status = unsafe { mfem_laghos_mesh_close(handle) };
            if status != 0 {
                return Err(IndexError::SourceRead(format!(
                    "native close failed with status {}",
                    status
                )));
            }
        }
        Ok(())
    }
}

impl Drop for LaghosSource {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("closing Laghos mesh: {}", e);
        }
    }
}
