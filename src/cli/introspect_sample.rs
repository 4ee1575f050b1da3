use {
    crate::{cli::GlobalArgs, introspection, proxy::ProxyType, utils::errorfmt::ErrorFmt},
    std::process,
};

pub fn main(_global: GlobalArgs) {
    match introspection::introspectable().to_xml() {
        Ok(xml) => print!("{}", xml),
        Err(e) => {
            log::error!("Could not write the interface description: {}", ErrorFmt(e));
            process::exit(1);
        }
    }
    print!("\n{}", ProxyType::introspectable().describe());
}
