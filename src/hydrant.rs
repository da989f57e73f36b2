//! Random legal-value generation for round-trip testing (§4.F).
//!
//! Given any `Type`, `generate` produces a `Data` with every slot
//! populated, terminating even on self-referential-looking shapes like
//! `Error(Error(...))` since `Type` itself is always a finite tree.

use rand::Rng;

use crate::data::Data;
use crate::types::Type;

/// Maximum length drawn for each dimension of a generated `List`.
const MAX_LIST_DIM: usize = 5;

/// Maximum number of bytes drawn for a generated `Str`.
const MAX_STR_LEN: usize = 12;

/// Produce a `Data` of type `ty` with every slot filled from `rng`.
pub fn generate<R: Rng + ?Sized>(ty: &Type, rng: &mut R) -> Data {
    let mut data = Data::new(ty.clone());
    fill(&mut data, rng);
    data
}

fn fill<R: Rng + ?Sized>(data: &mut Data, rng: &mut R) {
    match data.data_type().clone() {
        Type::Empty => {}
        Type::Bool => {
            data.set_bool(rng.gen(), &[]).unwrap();
        }
        Type::Int => {
            data.set_int(rng.gen(), &[]).unwrap();
        }
        Type::Word => {
            data.set_word(rng.gen(), &[]).unwrap();
        }
        Type::Value(_) => {
            data.set_value(rng.gen_range(-1e6..1e6), &[]).unwrap();
        }
        Type::Complex(_) => {
            data.set_complex((rng.gen_range(-1e6..1e6), rng.gen_range(-1e6..1e6)), &[])
                .unwrap();
        }
        Type::Time => {
            data.set_time(crate::time::LabradTime::new(rng.gen(), rng.gen()), &[])
                .unwrap();
        }
        Type::Str => {
            let len = rng.gen_range(0..=MAX_STR_LEN);
            let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            data.set_bytes(&bytes, &[]).unwrap();
        }
        Type::List { depth, .. } => {
            let shape: Vec<usize> = (0..depth).map(|_| rng.gen_range(0..=MAX_LIST_DIM)).collect();
            data.set_array_shape(&shape, &[]).unwrap();
            let total: usize = shape.iter().product();
            let mut indices = vec![0usize; depth];
            for flat in 0..total {
                let mut rem = flat;
                for d in (0..depth).rev() {
                    indices[d] = rem % shape[d];
                    rem /= shape[d];
                }
                let mut elem = data.get_data(&indices).unwrap();
                fill(&mut elem, rng);
            }
        }
        Type::Cluster { children, .. } => {
            for i in 0..children.len() {
                let mut child = data.get_data(&[i]).unwrap();
                fill(&mut child, rng);
            }
        }
        Type::Error { payload } => {
            let code = rng.gen();
            let msg_len = rng.gen_range(0..=MAX_STR_LEN);
            let message: String = (0..msg_len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect();
            data.set_error(code, &message, &[]).unwrap();
            if !matches!(payload.as_ref(), Type::Empty) {
                let mut inner = data.error_payload(&[]).unwrap();
                fill(&mut inner, rng);
            }
        }
    }
}
