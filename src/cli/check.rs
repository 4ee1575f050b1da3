use {
    crate::{
        cli::{CheckArgs, GlobalArgs},
        introspection::SchemaError,
        proxy::ProxyType,
        utils::errorfmt::ErrorFmt,
    },
    std::{fs, io, path::PathBuf, process, rc::Rc},
    thiserror::Error,
};

#[derive(Debug, Error)]
enum CheckError {
    #[error("Could not read {}", .0.display())]
    Read(PathBuf, #[source] io::Error),
    #[error("{} is not a valid interface description", .0.display())]
    Schema(PathBuf, #[source] SchemaError),
}

pub fn main(_global: GlobalArgs, args: CheckArgs) {
    let mut failed = false;
    for file in args.files {
        match load(file) {
            Ok(ty) => print!("{}", ty.describe()),
            Err(e) => {
                log::error!("{}", ErrorFmt(e));
                failed = true;
            }
        }
    }
    if failed {
        process::exit(1);
    }
}

fn load(file: PathBuf) -> Result<Rc<ProxyType>, CheckError> {
    let xml = match fs::read_to_string(&file) {
        Ok(xml) => xml,
        Err(e) => return Err(CheckError::Read(file, e)),
    };
    log::debug!("Loading {}", file.display());
    ProxyType::from_xml(&xml).map_err(|e| CheckError::Schema(file, e))
}
