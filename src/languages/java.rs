//! Java language adapter
//!
//! The submission is written under its own declared class name next to a
//! generated `TestRunner` driver; one `sh -c` invocation compiles both
//! and runs the driver, so compilation failures surface exactly like
//! runtime failures. The driver locates the entry method reflectively:
//! a public method with the configured name whose parameter count equals
//! the case's argument count, invoked statically or on a no-arg instance.
//! Arguments and the comparison both go through Gson, so equality is
//! JSON-value equality.

use std::path::Path;

use async_trait::async_trait;
use tokio::fs;

use super::{
    case_file_name, interpret_with_markers, is_valid_entry_point, java_runtime,
    write_case_file, HarnessError, Interpretation, Language, LanguageAdapter, EXIT_MISMATCH,
};
use crate::executor::SubmissionJob;
use crate::sandbox::RawOutcome;

/// Stderr fragments that mean the VM hit the memory ceiling.
const OOM_MARKERS: &[&str] = &["Cannot allocate memory", "OutOfMemoryError"];

const DRIVER_TEMPLATE: &str = r#"import com.google.gson.Gson;
import com.google.gson.JsonArray;
import com.google.gson.JsonElement;
import com.google.gson.JsonObject;
import com.google.gson.JsonParser;

import java.lang.reflect.Method;
import java.lang.reflect.Modifier;
import java.nio.charset.StandardCharsets;
import java.nio.file.Files;
import java.nio.file.Paths;

public final class TestRunner {
    public static void main(String[] args) throws Exception {
        String caseText = new String(Files.readAllBytes(Paths.get(args[0])), StandardCharsets.UTF_8);
        JsonObject testCase = JsonParser.parseString(caseText).getAsJsonObject();
        JsonArray input = testCase.getAsJsonArray("input");
        JsonElement expected = testCase.get("expected");

        Gson gson = new Gson();
        Class<?> cls = Class.forName("__ENTRY_CLASS__");
        Method method = findMethod(cls, "__ENTRY_POINT__", input.size());

        Object[] callArgs = new Object[input.size()];
        for (int i = 0; i < input.size(); i++) {
            callArgs[i] = gson.fromJson(input.get(i), method.getParameterTypes()[i]);
        }

        Object receiver = Modifier.isStatic(method.getModifiers())
                ? null
                : cls.getDeclaredConstructor().newInstance();
        Object result = method.invoke(receiver, callArgs);

        JsonElement actual = gson.toJsonTree(result);
        if (actual.equals(expected)) {
            System.exit(0);
        }

        System.err.println(actual);
        System.exit(__EXIT_MISMATCH__);
    }

    private static Method findMethod(Class<?> cls, String name, int arity) {
        for (Method candidate : cls.getMethods()) {
            if (candidate.getName().equals(name) && candidate.getParameterCount() == arity) {
                return candidate;
            }
        }
        throw new IllegalArgumentException(
                "No public method named " + name + " taking " + arity + " arguments");
    }
}
"#;

pub struct JavaAdapter;

impl JavaAdapter {
    pub fn new() -> Self {
        Self
    }

    fn driver_source(entry_class: &str, entry_point: &str) -> String {
        DRIVER_TEMPLATE
            .replace("__ENTRY_CLASS__", entry_class)
            .replace("__ENTRY_POINT__", entry_point)
            .replace("__EXIT_MISMATCH__", &EXIT_MISMATCH.to_string())
    }
}

impl Default for JavaAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the class the submission must be saved as: the public class when
/// one is declared, otherwise the first class declaration.
fn scan_entry_class(source: &str) -> Option<String> {
    let mut fallback = None;

    for line in source.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        for (i, token) in tokens.iter().enumerate() {
            if *token != "class" {
                continue;
            }
            let name = match tokens.get(i + 1).map(|raw| class_name_of(raw)) {
                Some(name) if !name.is_empty() => name,
                _ => continue,
            };
            if tokens[..i].contains(&"public") {
                return Some(name);
            }
            if fallback.is_none() {
                fallback = Some(name);
            }
        }
    }

    fallback
}

/// Trim generics and the opening brace off a class-name token.
fn class_name_of(token: &str) -> String {
    let mut name = String::new();
    for (i, c) in token.chars().enumerate() {
        let valid = c.is_ascii_alphanumeric() || c == '_' || c == '$';
        let valid_start = c.is_ascii_alphabetic() || c == '_' || c == '$';
        if (i == 0 && !valid_start) || !valid {
            break;
        }
        name.push(c);
    }
    name
}

#[async_trait]
impl LanguageAdapter for JavaAdapter {
    fn language(&self) -> Language {
        Language::Java
    }

    async fn build_harness(
        &self,
        job: &SubmissionJob,
        test_index: usize,
        dir: &Path,
    ) -> Result<(), HarnessError> {
        if !is_valid_entry_point(&job.entry_point) {
            return Err(HarnessError::InvalidEntryPoint(job.entry_point.clone()));
        }
        let entry_class = match scan_entry_class(&job.source_code) {
            Some(name) => name,
            None => return Err(HarnessError::MissingEntryClass),
        };

        fs::write(
            dir.join(format!("{}.java", entry_class)),
            &job.source_code,
        )
        .await?;
        fs::write(
            dir.join("TestRunner.java"),
            Self::driver_source(&entry_class, &job.entry_point),
        )
        .await?;
        write_case_file(
            dir,
            test_index,
            &job.inputs[test_index],
            &job.expected_outputs[test_index],
        )
        .await?;
        Ok(())
    }

    fn execution_command(&self, test_index: usize) -> Vec<String> {
        let runtime = java_runtime();
        let classpath = format!(".:{}", runtime.json_classpath);
        let script = format!(
            "{javac} -cp {cp} *.java && {java} -cp {cp} TestRunner {case}",
            javac = runtime.javac,
            java = runtime.java,
            cp = classpath,
            case = case_file_name(test_index),
        );
        vec!["sh".to_string(), "-c".to_string(), script]
    }

    fn interpret(&self, outcome: &RawOutcome) -> Interpretation {
        interpret_with_markers(outcome, OOM_MARKERS)
    }
}
