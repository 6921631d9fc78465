use std::collections::{btree_map::Entry, BTreeMap, BTreeSet};

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use url::Url;

use crate::{component, LogForwarderSpec, OutputType, RESERVED_INPUT_NAMES};

const SYSLOG_SCHEMES: [&str; 3] = ["tcp", "udp", "tls"];

#[derive(Snafu, Debug, PartialEq)]
pub enum ValidationError {
    #[snafu(display("output name [{name}] is declared more than once"))]
    DuplicateOutputName { name: String },

    #[snafu(display("input name [{name}] is declared more than once"))]
    DuplicateInputName { name: String },

    #[snafu(display("filter name [{name}] is declared more than once"))]
    DuplicateFilterName { name: String },

    #[snafu(display("pipeline name [{name}] is declared more than once"))]
    DuplicatePipelineName { name: String },

    #[snafu(display("pipeline [{pipeline}] references filter [{name}] more than once"))]
    DuplicateFilterRef { pipeline: String, name: String },

    #[snafu(display("[{name}] and [{other}] both compile to component [{id}]"))]
    ConflictingComponentId {
        id: String,
        name: String,
        other: String,
    },

    #[snafu(display("input name [{name}] is reserved"))]
    ReservedInputName { name: String },

    #[snafu(display("input [{name}] must declare exactly one of application, infrastructure, audit or receiver"))]
    AmbiguousInputKind { name: String },

    #[snafu(display("pipeline [{pipeline}] must reference at least one input and one output"))]
    EmptyPipeline { pipeline: String },

    #[snafu(display("pipeline [{pipeline}] references undeclared input [{name}]"))]
    UndeclaredInput { pipeline: String, name: String },

    #[snafu(display("pipeline [{pipeline}] references undeclared output [{name}]"))]
    UndeclaredOutput { pipeline: String, name: String },

    #[snafu(display("pipeline [{pipeline}] references undeclared filter [{name}]"))]
    UndeclaredFilter { pipeline: String, name: String },

    #[snafu(display("output [{output}] of type {type_} requires field [{field}]"))]
    MissingOutputField {
        output: String,
        type_: OutputType,
        field: &'static str,
    },

    #[snafu(display("output [{output}] has an invalid URL [{url}]"))]
    InvalidUrl {
        source: url::ParseError,
        output: String,
        url: String,
    },

    #[snafu(display("output [{output}] uses unsupported scheme [{scheme}] for {type_}"))]
    UnsupportedScheme {
        output: String,
        type_: OutputType,
        scheme: String,
    },
}

impl LogForwarderSpec {
    /// Checks the structural invariants the compiler relies on. Pipelines that pass never
    /// reference an undeclared name and every output carries its type-specific fields.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut ids = ComponentIds::default();

        let mut output_names = BTreeSet::new();
        for output in &self.outputs {
            ensure!(
                output_names.insert(output.name.as_str()),
                DuplicateOutputNameSnafu { name: &output.name }
            );
            ids.claim(component::output_id(&output.name), &output.name)?;
            validate_output(output)?;
        }

        for name in RESERVED_INPUT_NAMES {
            ids.claim(component::input_id(name), name)?;
        }

        let mut input_names = BTreeSet::new();
        for input in &self.inputs {
            ensure!(
                !RESERVED_INPUT_NAMES.contains(&input.name.as_str()),
                ReservedInputNameSnafu { name: &input.name }
            );
            ensure!(
                input_names.insert(input.name.as_str()),
                DuplicateInputNameSnafu { name: &input.name }
            );
            ensure!(
                input.declared_kinds() == 1,
                AmbiguousInputKindSnafu { name: &input.name }
            );
            let input_id = component::input_id(&input.name);
            if input.receiver.is_some() {
                ids.claim(component::receiver_id(&input_id), &input.name)?;
            }
            ids.claim(input_id, &input.name)?;
        }

        let mut filter_names = BTreeSet::new();
        for filter in &self.filters {
            ensure!(
                filter_names.insert(filter.name.as_str()),
                DuplicateFilterNameSnafu { name: &filter.name }
            );
        }

        let pipeline_names: Vec<String> = self
            .pipelines
            .iter()
            .enumerate()
            .map(|(index, pipeline)| pipeline.name_or_default(index))
            .collect();
        let mut declared_pipelines = BTreeSet::new();
        for name in &pipeline_names {
            ensure!(
                declared_pipelines.insert(name.as_str()),
                DuplicatePipelineNameSnafu { name }
            );
            ids.claim(component::pipeline_id(name), name)?;
        }

        for (pipeline, pipeline_name) in self.pipelines.iter().zip(&pipeline_names) {
            ensure!(
                !pipeline.input_refs.is_empty() && !pipeline.output_refs.is_empty(),
                EmptyPipelineSnafu {
                    pipeline: pipeline_name
                }
            );
            for name in &pipeline.input_refs {
                ensure!(
                    input_names.contains(name.as_str())
                        || RESERVED_INPUT_NAMES.contains(&name.as_str()),
                    UndeclaredInputSnafu {
                        pipeline: pipeline_name,
                        name
                    }
                );
            }
            for name in &pipeline.output_refs {
                ensure!(
                    output_names.contains(name.as_str()),
                    UndeclaredOutputSnafu {
                        pipeline: pipeline_name,
                        name
                    }
                );
            }
            let pipeline_id = component::pipeline_id(pipeline_name);
            let mut referenced_filters = BTreeSet::new();
            for name in &pipeline.filter_refs {
                ensure!(
                    filter_names.contains(name.as_str()),
                    UndeclaredFilterSnafu {
                        pipeline: pipeline_name,
                        name
                    }
                );
                ensure!(
                    referenced_filters.insert(name.as_str()),
                    DuplicateFilterRefSnafu {
                        pipeline: pipeline_name,
                        name
                    }
                );
                ids.claim(
                    component::filter_id(&pipeline_id, name),
                    &format!("{pipeline_name}/{name}"),
                )?;
            }
        }

        tracing::debug!(
            outputs = output_names.len(),
            inputs = input_names.len(),
            pipelines = self.pipelines.len(),
            "Validated forwarder spec"
        );
        Ok(())
    }
}

/// Component IDs claimed so far, mapped to the name that claimed them.
#[derive(Default)]
struct ComponentIds(BTreeMap<String, String>);

impl ComponentIds {
    fn claim(&mut self, id: String, name: &str) -> Result<(), ValidationError> {
        match self.0.entry(id) {
            Entry::Vacant(entry) => {
                entry.insert(name.to_string());
                Ok(())
            }
            Entry::Occupied(entry) => ConflictingComponentIdSnafu {
                id: entry.key(),
                name,
                other: entry.get(),
            }
            .fail(),
        }
    }
}

fn validate_output(output: &crate::Output) -> Result<(), ValidationError> {
    let missing = |field: &'static str| MissingOutputFieldSnafu {
        output: &output.name,
        type_: output.type_,
        field,
    };

    match output.type_ {
        OutputType::Cloudwatch => {
            let cloudwatch = output.cloudwatch.as_ref().context(missing("cloudwatch"))?;
            ensure!(!cloudwatch.region.is_empty(), missing("cloudwatch.region"));
        }
        OutputType::Elasticsearch | OutputType::Syslog | OutputType::Http => {
            ensure!(!output.url().is_empty(), missing("url"));
        }
    }

    if output.url().is_empty() {
        return Ok(());
    }
    let url = Url::parse(output.url()).context(InvalidUrlSnafu {
        output: &output.name,
        url: output.url(),
    })?;
    if output.type_ == OutputType::Syslog {
        ensure!(
            SYSLOG_SCHEMES.contains(&url.scheme()),
            UnsupportedSchemeSnafu {
                output: &output.name,
                type_: output.type_,
                scheme: url.scheme(),
            }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::LogForwarder;

    fn spec(input: &str) -> LogForwarderSpec {
        let forwarder: LogForwarder = serde_yaml::from_str(input).expect("illegal test input");
        forwarder.spec
    }

    const VALID: &str = r#"
    apiVersion: logging.forwarder.dev/v1
    kind: LogForwarder
    metadata:
      name: instance
    spec:
      filters:
        - name: multiline
          type: detectMultilineException
      pipelines:
        - name: infra-to-cw
          inputRefs: [infrastructure]
          outputRefs: [cw]
          filterRefs: [multiline]
      outputs:
        - name: cw
          type: cloudwatch
          cloudwatch:
            region: us-east-77
        - name: unused
          type: syslog
          url: tls://syslog.example.com:6514
    "#;

    #[test]
    fn test_valid_spec() {
        assert_eq!(spec(VALID).validate(), Ok(()));
    }

    #[rstest]
    #[case::undeclared_output(
        "outputRefs: [cw]",
        "outputRefs: [missing]",
        ValidationError::UndeclaredOutput { pipeline: "infra-to-cw".to_string(), name: "missing".to_string() }
    )]
    #[case::undeclared_input(
        "inputRefs: [infrastructure]",
        "inputRefs: [nope]",
        ValidationError::UndeclaredInput { pipeline: "infra-to-cw".to_string(), name: "nope".to_string() }
    )]
    #[case::undeclared_filter(
        "filterRefs: [multiline]",
        "filterRefs: [multiline, other]",
        ValidationError::UndeclaredFilter { pipeline: "infra-to-cw".to_string(), name: "other".to_string() }
    )]
    #[case::missing_region(
        "region: us-east-77",
        "region: \"\"",
        ValidationError::MissingOutputField { output: "cw".to_string(), type_: OutputType::Cloudwatch, field: "cloudwatch.region" }
    )]
    #[case::duplicate_output(
        "name: unused",
        "name: cw",
        ValidationError::DuplicateOutputName { name: "cw".to_string() }
    )]
    #[case::empty_pipeline(
        "outputRefs: [cw]",
        "outputRefs: []",
        ValidationError::EmptyPipeline { pipeline: "infra-to-cw".to_string() }
    )]
    #[case::syslog_scheme(
        "url: tls://syslog.example.com:6514",
        "url: https://syslog.example.com:6514",
        ValidationError::UnsupportedScheme { output: "unused".to_string(), type_: OutputType::Syslog, scheme: "https".to_string() }
    )]
    fn test_invalid_spec(#[case] from: &str, #[case] to: &str, #[case] expected: ValidationError) {
        let input = VALID.replacen(from, to, 1);
        assert_eq!(spec(&input).validate(), Err(expected));
    }

    #[test]
    fn test_missing_url() {
        let input = VALID.replacen("url: tls://syslog.example.com:6514", "", 1);
        assert_eq!(
            spec(&input).validate(),
            Err(ValidationError::MissingOutputField {
                output: "unused".to_string(),
                type_: OutputType::Syslog,
                field: "url",
            })
        );
    }

    #[test]
    fn test_invalid_url() {
        let input = VALID.replacen("tls://syslog.example.com:6514", "not a url", 1);
        assert!(matches!(
            spec(&input).validate(),
            Err(ValidationError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_reserved_and_ambiguous_inputs() {
        let reserved = LogForwarderSpec {
            inputs: vec![crate::Input::reserved("audit").unwrap()],
            ..LogForwarderSpec::default()
        };
        assert_eq!(
            reserved.validate(),
            Err(ValidationError::ReservedInputName {
                name: "audit".to_string()
            })
        );

        let ambiguous = LogForwarderSpec {
            inputs: vec![crate::Input {
                name: "custom".to_string(),
                ..crate::Input::default()
            }],
            ..LogForwarderSpec::default()
        };
        assert_eq!(
            ambiguous.validate(),
            Err(ValidationError::AmbiguousInputKind {
                name: "custom".to_string()
            })
        );
    }

    const ROUTES: &str = r#"
    apiVersion: logging.forwarder.dev/v1
    kind: LogForwarder
    metadata:
      name: instance
    spec:
      inputs:
        - name: my-apps
          application:
            namespaces: [team-a]
        - name: my_apps
          audit: {}
      filters:
        - name: json
          type: parseJson
      pipelines:
        - name: a
          inputRefs: [my-apps]
          outputRefs: [es]
        - name: b
          inputRefs: [my_apps]
          outputRefs: [es]
          filterRefs: [json]
      outputs:
        - name: es
          type: elasticsearch
          url: https://es.svc:9200
    "#;

    #[test]
    fn test_inputs_sharing_a_component_id() {
        assert_eq!(
            spec(ROUTES).validate(),
            Err(ValidationError::ConflictingComponentId {
                id: "input_my_apps".to_string(),
                name: "my_apps".to_string(),
                other: "my-apps".to_string(),
            })
        );
    }

    fn routes_with_distinct_inputs() -> String {
        ROUTES
            .replacen("- name: my_apps", "- name: other-apps", 1)
            .replacen("inputRefs: [my_apps]", "inputRefs: [other-apps]", 1)
    }

    #[rstest]
    #[case::same_pipeline_name(
        "name: b",
        "name: a",
        ValidationError::DuplicatePipelineName { name: "a".to_string() }
    )]
    #[case::repeated_filter_ref(
        "filterRefs: [json]",
        "filterRefs: [json, json]",
        ValidationError::DuplicateFilterRef { pipeline: "b".to_string(), name: "json".to_string() }
    )]
    #[case::pipeline_and_filter_id(
        "name: a",
        "name: b-json",
        ValidationError::ConflictingComponentId {
            id: "pipeline_b_json".to_string(),
            name: "b/json".to_string(),
            other: "b-json".to_string(),
        }
    )]
    fn test_colliding_pipeline_components(
        #[case] from: &str,
        #[case] to: &str,
        #[case] expected: ValidationError,
    ) {
        let input = routes_with_distinct_inputs().replacen(from, to, 1);
        assert_eq!(spec(&input).validate(), Err(expected));
    }

    #[test]
    fn test_explicit_name_equal_to_default_name() {
        let input = routes_with_distinct_inputs()
            .replacen("name: a", "name: pipeline_1", 1)
            .replacen("- name: b\n          inputRefs", "- inputRefs", 1);
        assert_eq!(
            spec(&input).validate(),
            Err(ValidationError::DuplicatePipelineName {
                name: "pipeline_1".to_string()
            })
        );
    }

    #[test]
    fn test_outputs_differing_only_in_case() {
        let input = routes_with_distinct_inputs().replacen(
            "outputs:\n",
            "outputs:\n        - name: ES\n          type: elasticsearch\n          url: https://es2.svc:9200\n",
            1,
        );
        assert_eq!(
            spec(&input).validate(),
            Err(ValidationError::ConflictingComponentId {
                id: "output_es".to_string(),
                name: "es".to_string(),
                other: "ES".to_string(),
            })
        );
    }

    #[test]
    fn test_input_shadowing_reserved_input() {
        let input = ROUTES
            .replacen("- name: my_apps", "- name: Audit", 1)
            .replacen("inputRefs: [my_apps]", "inputRefs: [Audit]", 1);
        assert_eq!(
            spec(&input).validate(),
            Err(ValidationError::ConflictingComponentId {
                id: "input_audit".to_string(),
                name: "Audit".to_string(),
                other: "audit".to_string(),
            })
        );
    }
}
