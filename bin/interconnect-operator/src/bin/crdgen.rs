//! Print the Interconnect CRD manifest as YAML

use anyhow::Result;
use interconnect_api::Interconnect;
use kube::CustomResourceExt;

fn main() -> Result<()> {
    print!("{}", serde_yaml::to_string(&Interconnect::crd())?);
    Ok(())
}
