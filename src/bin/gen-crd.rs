use kube::CustomResourceExt;
use kulta_canary::crd::canary::Canary;

fn main() -> anyhow::Result<()> {
    // Pipe through a YAML converter to produce the manifest:
    // cargo run --bin gen-crd | python3 -c "import sys,json,yaml; print(yaml.dump(json.load(sys.stdin), default_flow_style=False))"
    let crd = serde_json::to_value(Canary::crd())?;
    println!("{}", serde_json::to_string_pretty(&crd)?);
    Ok(())
}
