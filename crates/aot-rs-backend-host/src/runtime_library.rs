//! Native routines the emitted thunks call through the custom call registry.

use std::ffi::c_void;
use std::ops::{Add, Mul};
use std::sync::Once;

use aot_rs::custom_call::register_custom_call;
use aot_rs::thunk::{matmul_symbol, MatMulDescriptor};
use aot_rs::ElementType;
use tracing::debug;

static REGISTER: Once = Once::new();

/// Registers the host runtime routines in the global registry. Idempotent.
pub fn register_runtime_library() {
    REGISTER.call_once(|| {
        let routines: [(ElementType, aot_rs::custom_call::CustomCallFn); 2] = [
            (ElementType::F32, matmul_f32),
            (ElementType::F64, matmul_f64),
        ];
        for (element_type, function) in routines {
            if let Some(symbol) = matmul_symbol(element_type) {
                register_custom_call(symbol, function);
            }
        }
        debug!("host runtime library registered");
    });
}

/// # Safety
/// `outputs[0]`, `inputs[0]` and `inputs[1]` must point at buffers large enough
/// for the strides in the descriptor.
unsafe fn strided_matmul<T>(
    outputs: *const *mut c_void,
    inputs: *const *const c_void,
    opaque: *const u8,
    opaque_len: usize,
) where
    T: Copy + Default + Add<Output = T> + Mul<Output = T>,
{
    if outputs.is_null() || inputs.is_null() || opaque.is_null() {
        return;
    }
    let payload = std::slice::from_raw_parts(opaque, opaque_len);
    let Some(desc) = MatMulDescriptor::decode(payload) else {
        return;
    };
    let lhs = *inputs as *const T;
    let rhs = *inputs.add(1) as *const T;
    let out = *outputs as *mut T;
    let [lr, lc] = desc.lhs_strides.map(|s| s as usize);
    let [rr, rc] = desc.rhs_strides.map(|s| s as usize);
    let [or, oc] = desc.out_strides.map(|s| s as usize);
    for i in 0..desc.m as usize {
        for j in 0..desc.n as usize {
            let mut acc = T::default();
            for p in 0..desc.k as usize {
                acc = acc + *lhs.add(i * lr + p * lc) * *rhs.add(p * rr + j * rc);
            }
            *out.add(i * or + j * oc) = acc;
        }
    }
}

unsafe extern "C" fn matmul_f32(
    outputs: *const *mut c_void,
    inputs: *const *const c_void,
    opaque: *const u8,
    opaque_len: usize,
) {
    strided_matmul::<f32>(outputs, inputs, opaque, opaque_len);
}

unsafe extern "C" fn matmul_f64(
    outputs: *const *mut c_void,
    inputs: *const *const c_void,
    opaque: *const u8,
    opaque_len: usize,
) {
    strided_matmul::<f64>(outputs, inputs, opaque, opaque_len);
}
