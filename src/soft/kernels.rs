//! Host implementations of kernel functions.

use crate::opencl::types::*;
use bytemuck::Pod;
use std::collections::BTreeMap;
use std::mem::size_of;
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError};

/// Kind of one kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    /// A `global` or `constant` pointer: a buffer or SVM pointer.
    Buffer,
    /// A by-value argument of this many bytes.
    Scalar(usize),
    /// A `local` pointer; only its size is set from the host.
    Local,
}

pub type KernelBody = dyn Fn(&mut WorkItem<'_>) -> Result<(), cl_int> + Send + Sync;

pub(crate) struct KernelDef {
    pub(crate) params: Vec<Param>,
    pub(crate) body: Arc<KernelBody>,
}

static REGISTRY: Mutex<BTreeMap<String, Arc<KernelDef>>> = Mutex::new(BTreeMap::new());

/// Registers the host implementation of kernel `name`.
///
/// A program declaring `name` builds only if an implementation with the same
/// number of parameters is registered. Registering a name again replaces the
/// previous implementation for kernels created afterwards.
pub fn register_kernel<F>(name: &str, params: &[Param], body: F)
where
    F: Fn(&mut WorkItem<'_>) -> Result<(), cl_int> + Send + Sync + 'static,
{
    let def = KernelDef {
        params: params.to_vec(),
        body: Arc::new(body),
    };
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name.to_string(), Arc::new(def));
}

pub(crate) fn lookup(name: &str) -> Option<Arc<KernelDef>> {
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned()
}

/// A kernel declaration found in program source.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Declaration {
    pub(crate) name: String,
    pub(crate) params: usize,
}

/// Finds every `kernel void name(...)` declaration in `source`.
pub(crate) fn scan(source: &str) -> Result<Vec<Declaration>, String> {
    let mut depth = 0i64;
    for (line, text) in source.lines().enumerate() {
        for c in text.chars() {
            match c {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
            if depth < 0 {
                return Err(format!("{}: error: unexpected '}}'", line + 1));
            }
        }
    }
    if depth != 0 {
        return Err("error: expected '}' at end of input".to_string());
    }

    let mut found = Vec::new();
    let mut rest = source;
    while let Some(at) = find_kernel_keyword(rest) {
        rest = &rest[at..];
        let Some(open) = rest.find('(') else {
            return Err("error: expected '(' after kernel name".to_string());
        };
        let Some(close) = rest[open..].find(')') else {
            return Err("error: expected ')' in kernel declaration".to_string());
        };
        let head: Vec<&str> = rest[..open].split_whitespace().collect();
        let name = match head.as_slice() {
            [_, "void", name] => name.to_string(),
            _ => return Err(format!("error: malformed kernel declaration `{}`", rest[..open].trim())),
        };
        let list = rest[open + 1..open + close].trim();
        let params = if list.is_empty() || list == "void" {
            0
        } else {
            list.split(',').count()
        };
        found.push(Declaration { name, params });
        rest = &rest[open + close..];
    }
    Ok(found)
}

fn find_kernel_keyword(source: &str) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut from = 0;
    while from < source.len() {
        let hit = ["__kernel", "kernel"]
            .iter()
            .filter_map(|kw| source[from..].find(kw).map(|i| (from + i, kw.len())))
            .min_by_key(|&(i, _)| i)?;
        let (start, len) = hit;
        let before_ok = start == 0 || !is_ident(bytes[start - 1]);
        let after_ok = bytes.get(start + len).map_or(false, |b| b.is_ascii_whitespace());
        if before_ok && after_ok {
            return Some(start);
        }
        from = start + len;
    }
    None
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// One argument as seen by a running kernel.
#[derive(Clone, Copy)]
pub(crate) enum LaunchArg<'a> {
    Buffer { ptr: *mut u8, len: usize },
    Scalar(&'a [u8]),
    Local(usize),
}

/// The view of a launch from one work item.
pub struct WorkItem<'a> {
    args: &'a [LaunchArg<'a>],
    id: [usize; 3],
    global: [usize; 3],
    dims: usize,
}

impl<'a> WorkItem<'a> {
    pub(crate) fn new(args: &'a [LaunchArg<'a>], global: [usize; 3], dims: usize) -> Self {
        Self {
            args,
            id: [0; 3],
            global,
            dims,
        }
    }

    pub(crate) fn set_id(&mut self, id: [usize; 3]) {
        self.id = id;
    }

    pub fn work_dim(&self) -> usize {
        self.dims
    }

    pub fn global_id(&self, dim: usize) -> usize {
        self.id.get(dim).copied().unwrap_or(0)
    }

    pub fn global_size(&self, dim: usize) -> usize {
        if dim < self.dims {
            self.global[dim]
        } else {
            1
        }
    }

    fn buffer(&self, arg: usize) -> Result<(*mut u8, usize), cl_int> {
        match self.args.get(arg) {
            Some(LaunchArg::Buffer { ptr, len }) => Ok((*ptr, *len)),
            _ => Err(CL_INVALID_ARG_INDEX),
        }
    }

    /// Element count of buffer argument `arg` viewed as `T`.
    pub fn len<T: Pod>(&self, arg: usize) -> Result<usize, cl_int> {
        Ok(self.buffer(arg)?.1 / size_of::<T>())
    }

    pub fn read<T: Pod>(&self, arg: usize, index: usize) -> Result<T, cl_int> {
        let (base, len) = self.buffer(arg)?;
        let offset = element_offset::<T>(index, len)?;
        Ok(unsafe { ptr::read_unaligned(base.add(offset).cast::<T>()) })
    }

    pub fn write<T: Pod>(&mut self, arg: usize, index: usize, value: T) -> Result<(), cl_int> {
        let (base, len) = self.buffer(arg)?;
        let offset = element_offset::<T>(index, len)?;
        unsafe { ptr::write_unaligned(base.add(offset).cast::<T>(), value) };
        Ok(())
    }

    pub fn scalar<T: Pod>(&self, arg: usize) -> Result<T, cl_int> {
        match self.args.get(arg) {
            Some(LaunchArg::Scalar(bytes)) if bytes.len() == size_of::<T>() => {
                Ok(bytemuck::pod_read_unaligned(bytes))
            }
            Some(LaunchArg::Scalar(_)) => Err(CL_INVALID_ARG_SIZE),
            _ => Err(CL_INVALID_ARG_INDEX),
        }
    }

    /// Byte size of `local` argument `arg`.
    pub fn local_size(&self, arg: usize) -> Result<usize, cl_int> {
        match self.args.get(arg) {
            Some(LaunchArg::Local(size)) => Ok(*size),
            _ => Err(CL_INVALID_ARG_INDEX),
        }
    }
}

fn element_offset<T>(index: usize, len: usize) -> Result<usize, cl_int> {
    let size = size_of::<T>();
    match index.checked_mul(size) {
        Some(offset) if offset + size <= len => Ok(offset),
        _ => Err(CL_OUT_OF_RESOURCES),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_declarations() {
        let source = "
            __kernel void first(global float* a, float b) { a[0] = b; }
            kernel void second(void) {}
            void helper(int kernel_count) {}
        ";
        assert_eq!(
            scan(source).unwrap(),
            vec![
                Declaration { name: "first".into(), params: 2 },
                Declaration { name: "second".into(), params: 0 },
            ]
        );
    }

    #[test]
    fn unbalanced_braces_fail() {
        assert!(scan("kernel void f(int a) {").unwrap_err().contains("expected '}'"));
        assert!(scan("}").is_err());
    }

    #[test]
    fn work_item_accessors() {
        let mut storage = [0u8; 16];
        let scalar = 2.5f32.to_ne_bytes();
        let args = [
            LaunchArg::Buffer {
                ptr: storage.as_mut_ptr(),
                len: storage.len(),
            },
            LaunchArg::Scalar(&scalar),
            LaunchArg::Local(64),
        ];
        let mut item = WorkItem::new(&args, [4, 1, 1], 1);
        item.set_id([3, 0, 0]);

        assert_eq!(item.global_id(0), 3);
        assert_eq!(item.global_size(0), 4);
        assert_eq!(item.global_size(1), 1);
        assert_eq!(item.len::<f32>(0).unwrap(), 4);
        assert_eq!(item.scalar::<f32>(1).unwrap(), 2.5);
        assert_eq!(item.scalar::<f64>(1), Err(CL_INVALID_ARG_SIZE));
        assert_eq!(item.local_size(2).unwrap(), 64);

        item.write(0, 3, 7.0f32).unwrap();
        assert_eq!(item.read::<f32>(0, 3).unwrap(), 7.0);
        assert_eq!(item.read::<f32>(0, 4), Err(CL_OUT_OF_RESOURCES));
    }
}
