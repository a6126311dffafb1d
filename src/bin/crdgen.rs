//! Prints the `Session` CustomResourceDefinition manifest as YAML, so it can
//! be piped straight into `kubectl apply -f -` during cluster bootstrap.

use kube::CustomResourceExt;
use session_controller::Session;

fn main() {
    let crd = Session::crd();
    print!("{}", serde_yaml::to_string(&crd).expect("serializing CRD to YAML"));
}
