//! # PyTorch checkpoints
//!
//! Reads the zip based format written by `torch.save` (PyTorch 1.6 and
//! later) into named tensors.
pub mod pickle;

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use tch::Tensor;

fn zip_err(e: zip::result::ZipError) -> Error {
    Error::Checkpoint(e.to_string())
}

fn read_entry<R: Read + Seek>(archive: &mut zip::ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut entry = archive.by_name(name).map_err(zip_err)?;
    let mut data = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut data)?;
    Ok(data)
}

/// Loads every tensor of a `.pth`/`.pt` state dict, on the CPU.
pub fn read_pth<P: AsRef<Path>>(path: P) -> Result<Vec<(String, Tensor)>> {
    let file = crate::utils::file_open(path.as_ref())?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| {
        Error::Checkpoint(format!(
            "{:?} is not a zip checkpoint, legacy torch.save files are not supported: {e}",
            path.as_ref()
        ))
    })?;
    let pkl_name = archive
        .file_names()
        .find(|name| name.ends_with("data.pkl"))
        .map(String::from)
        .ok_or_else(|| Error::Checkpoint(format!("no data.pkl in {:?}", path.as_ref())))?;
    let prefix = pkl_name.trim_end_matches("data.pkl").to_string();
    let pkl = read_entry(&mut archive, &pkl_name)?;
    let infos = pickle::tensor_infos(pickle::parse(&pkl)?)?;

    // Several tensors can be views on the same storage.
    let mut storages: HashMap<String, Tensor> = HashMap::new();
    let mut tensors = Vec::with_capacity(infos.len());
    for (name, info) in infos {
        let storage = match storages.get(&info.storage_key) {
            Some(storage) => storage.shallow_clone(),
            None => {
                let data = read_entry(&mut archive, &format!("{prefix}data/{}", info.storage_key))?;
                let numel = (data.len() / info.kind.elt_size_in_bytes()) as i64;
                let storage = Tensor::f_from_data_size(&data, &[numel], info.kind)?;
                storages.insert(info.storage_key.clone(), storage.shallow_clone());
                storage
            }
        };
        let tensor = storage
            .f_as_strided(info.shape.as_slice(), info.stride.as_slice(), info.offset)?
            .f_contiguous()?;
        tensors.push((name, tensor));
    }
    log::debug!("read {} tensors from {:?}", tensors.len(), path.as_ref());
    Ok(tensors)
}
