//! Template context for response bodies.
//!
//! Each render builds a fresh tera instance whose functions close over the
//! current request, so nothing leaks between concurrent renders. Accessors:
//! `Query(name=..)`, `QueryIs(name=.., value=..)`, `Header(name=..)`,
//! `HeaderIs(name=.., value=..)`. The fake-data generators take an optional
//! `lang` argument; the chosen language sticks for later calls within the
//! same render. `UserName` always produces an English value.

use fake::Fake;
use fake::faker::address::raw::{CityName, CountryName, ZipCode};
use fake::faker::company::raw::{Buzzword, CompanyName};
use fake::faker::creditcard::raw::CreditCardNumber;
use fake::faker::internet::raw::{FreeEmail, IPv4, Password, Username};
use fake::faker::lorem::raw::{Paragraph, Sentence, Word};
use fake::faker::name::raw::{FirstName, LastName, Name};
use fake::faker::phone_number::raw::PhoneNumber;
use fake::locales::{EN, FR_FR, ZH_CN, ZH_TW};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tera::{Tera, Value};

/// Request data exposed to templates. Query parameters keep their multiplicity
/// and order; header lookup is case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl RequestContext {
    /// Joined values of a query parameter, space-separated when repeated.
    pub fn query_value(&self, name: &str) -> String {
        self.query
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Joined values of a header, space-separated when repeated.
    pub fn header_value(&self, name: &str) -> String {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Fake-data languages supported by the generators. Unknown codes fall back
/// to English.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lang {
    En,
    Fr,
    ZhCn,
    ZhTw,
}

impl Lang {
    fn from_code(code: &str) -> Lang {
        match code.to_ascii_lowercase().as_str() {
            "fr" | "fr_fr" | "fr-fr" => Lang::Fr,
            "zh" | "zh_cn" | "zh-cn" => Lang::ZhCn,
            "zh_tw" | "zh-tw" => Lang::ZhTw,
            _ => Lang::En,
        }
    }
}

macro_rules! by_lang {
    ($lang:expr, $faker:ident ( $($arg:expr),* )) => {
        match $lang {
            Lang::En => $faker(EN $(, $arg)*).fake::<String>(),
            Lang::Fr => $faker(FR_FR $(, $arg)*).fake::<String>(),
            Lang::ZhCn => $faker(ZH_CN $(, $arg)*).fake::<String>(),
            Lang::ZhTw => $faker(ZH_TW $(, $arg)*).fake::<String>(),
        }
    };
}

/// Render a response body template against the current request. Bodies with
/// no template markers pass through untouched.
pub fn render(content: &str, ctx: &RequestContext) -> Result<String, tera::Error> {
    if !content.contains("{{") && !content.contains("{%") {
        return Ok(content.to_string());
    }

    let mut tera = Tera::default();
    tera.autoescape_on(vec![]);
    register_request_accessors(&mut tera, ctx.clone());
    register_generators(&mut tera);
    tera.add_raw_template("response", content)?;
    tera.render("response", &tera::Context::new())
}

fn string_arg(args: &HashMap<String, Value>, name: &str) -> String {
    match args.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn int_arg(args: &HashMap<String, Value>, name: &str, default: i64) -> i64 {
    args.get(name).and_then(Value::as_i64).unwrap_or(default)
}

fn register_request_accessors(tera: &mut Tera, ctx: RequestContext) {
    let query_ctx = ctx.clone();
    tera.register_function(
        "Query",
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            Ok(Value::String(query_ctx.query_value(&string_arg(args, "name"))))
        },
    );

    let query_is_ctx = ctx.clone();
    tera.register_function(
        "QueryIs",
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let actual = query_is_ctx.query_value(&string_arg(args, "name"));
            Ok(Value::Bool(actual == string_arg(args, "value")))
        },
    );

    let header_ctx = ctx.clone();
    tera.register_function(
        "Header",
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            Ok(Value::String(header_ctx.header_value(&string_arg(args, "name"))))
        },
    );

    tera.register_function(
        "HeaderIs",
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let actual = ctx.header_value(&string_arg(args, "name"));
            Ok(Value::Bool(actual == string_arg(args, "value")))
        },
    );
}

/// Register a localized generator: the optional `lang` argument switches the
/// shared per-render language before generating.
fn localized<F>(tera: &mut Tera, name: &'static str, lang: Arc<Mutex<Lang>>, generate: F)
where
    F: Fn(Lang) -> Value + Send + Sync + 'static,
{
    tera.register_function(
        name,
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let mut current = lang.lock().unwrap();
            if let Some(Value::String(code)) = args.get("lang") {
                if !code.is_empty() {
                    *current = Lang::from_code(code);
                }
            }
            Ok(generate(*current))
        },
    );
}

fn register_generators(tera: &mut Tera) {
    // One language cell per render; concurrent renders never share it.
    let lang = Arc::new(Mutex::new(Lang::En));

    localized(tera, "Brand", lang.clone(), |l| {
        Value::String(by_lang!(l, Buzzword()))
    });
    localized(tera, "City", lang.clone(), |l| {
        Value::String(by_lang!(l, CityName()))
    });
    localized(tera, "Company", lang.clone(), |l| {
        Value::String(by_lang!(l, CompanyName()))
    });
    localized(tera, "Country", lang.clone(), |l| {
        Value::String(by_lang!(l, CountryName()))
    });
    localized(tera, "FirstName", lang.clone(), |l| {
        Value::String(by_lang!(l, FirstName()))
    });
    localized(tera, "LastName", lang.clone(), |l| {
        Value::String(by_lang!(l, LastName()))
    });
    localized(tera, "FullName", lang.clone(), |l| {
        Value::String(by_lang!(l, Name()))
    });
    localized(tera, "Word", lang.clone(), |l| {
        Value::String(by_lang!(l, Word()))
    });
    localized(tera, "Sentence", lang.clone(), |l| {
        Value::String(by_lang!(l, Sentence(4..10)))
    });
    localized(tera, "Paragraph", lang.clone(), |l| {
        Value::String(by_lang!(l, Paragraph(2..5)))
    });
    localized(tera, "Phone", lang.clone(), |l| {
        Value::String(by_lang!(l, PhoneNumber()))
    });
    localized(tera, "Zip", lang.clone(), |l| {
        Value::String(by_lang!(l, ZipCode()))
    });

    // Language-independent generators; a `lang` argument still updates the
    // remembered language for later calls.
    localized(tera, "EmailAddress", lang.clone(), |_| {
        Value::String(FreeEmail(EN).fake::<String>())
    });
    localized(tera, "CreditCardNum", lang.clone(), |_| {
        Value::String(CreditCardNumber(EN).fake::<String>())
    });
    localized(tera, "IPv4", lang.clone(), |_| {
        Value::String(IPv4(EN).fake::<String>())
    });
    localized(tera, "HexColor", lang.clone(), |_| {
        Value::String(format!("#{:06X}", rand::random_range(0..0x100_0000)))
    });
    localized(tera, "Latitude", lang.clone(), |_| {
        Value::String(format!("{:.6}", rand::random_range(-90.0..90.0)))
    });
    localized(tera, "Longitude", lang.clone(), |_| {
        Value::String(format!("{:.6}", rand::random_range(-180.0..180.0)))
    });
    localized(tera, "Day", lang.clone(), |_| {
        Value::from(rand::random_range(1..=31i64))
    });
    localized(tera, "MonthNum", lang.clone(), |_| {
        Value::from(rand::random_range(1..=12i64))
    });
    localized(tera, "Month", lang.clone(), |_| {
        const MONTHS: [&str; 12] = [
            "January", "February", "March", "April", "May", "June", "July", "August",
            "September", "October", "November", "December",
        ];
        Value::String(MONTHS[rand::random_range(0..MONTHS.len())].to_string())
    });
    localized(tera, "WeekDay", lang.clone(), |_| {
        const DAYS: [&str; 7] = [
            "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday",
        ];
        Value::String(DAYS[rand::random_range(0..DAYS.len())].to_string())
    });

    // Always English, whatever the remembered language.
    tera.register_function(
        "UserName",
        |_: &HashMap<String, Value>| -> tera::Result<Value> {
            Ok(Value::String(Username(EN).fake::<String>()))
        },
    );

    tera.register_function(
        "Password",
        |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let min = int_arg(args, "min", 8).max(1) as usize;
            let max = (int_arg(args, "max", 16).max(min as i64)) as usize;
            Ok(Value::String(Password(EN, min..max + 1).fake::<String>()))
        },
    );

    tera.register_function(
        "Year",
        |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let from = int_arg(args, "from", 1970);
            let to = int_arg(args, "to", 2020).max(from);
            Ok(Value::from(rand::random_range(from..=to)))
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext {
            query: vec![
                ("tag".into(), "a".into()),
                ("tag".into(), "b".into()),
                ("id".into(), "42".into()),
            ],
            headers: vec![
                ("User-Agent".into(), "curl/8".into()),
                ("X-Token".into(), "secret".into()),
            ],
        }
    }

    #[test]
    fn plain_body_passes_through() {
        let body = "no templates here { just braces }";
        assert_eq!(render(body, &ctx()).unwrap(), body);
    }

    #[test]
    fn query_accessor_joins_repeated_values() {
        let out = render("{{ Query(name=\"tag\") }}", &ctx()).unwrap();
        assert_eq!(out, "a b");
        let out = render("{{ Query(name=\"id\") }}", &ctx()).unwrap();
        assert_eq!(out, "42");
        let out = render("{{ Query(name=\"missing\") }}", &ctx()).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn header_accessor_is_case_insensitive() {
        let out = render("{{ Header(name=\"user-agent\") }}", &ctx()).unwrap();
        assert_eq!(out, "curl/8");
    }

    #[test]
    fn predicates_work_in_conditionals() {
        let tpl = "{% if QueryIs(name=\"id\", value=\"42\") %}yes{% else %}no{% endif %}";
        assert_eq!(render(tpl, &ctx()).unwrap(), "yes");

        let tpl = "{% if HeaderIs(name=\"X-Token\", value=\"wrong\") %}yes{% else %}no{% endif %}";
        assert_eq!(render(tpl, &ctx()).unwrap(), "no");
    }

    #[test]
    fn generators_produce_values() {
        for tpl in [
            "{{ Brand() }}",
            "{{ City() }}",
            "{{ Company() }}",
            "{{ Country() }}",
            "{{ FirstName() }}",
            "{{ LastName() }}",
            "{{ FullName() }}",
            "{{ Word() }}",
            "{{ Sentence() }}",
            "{{ Paragraph() }}",
            "{{ Phone() }}",
            "{{ Zip() }}",
            "{{ EmailAddress() }}",
            "{{ CreditCardNum() }}",
            "{{ IPv4() }}",
            "{{ UserName() }}",
            "{{ Month() }}",
            "{{ WeekDay() }}",
        ] {
            let out = render(tpl, &ctx()).unwrap();
            assert!(!out.is_empty(), "empty output for {tpl}");
        }
    }

    #[test]
    fn localized_generators_accept_language_codes() {
        let out = render("{{ City(lang=\"fr\") }} / {{ Country() }}", &ctx()).unwrap();
        let parts: Vec<&str> = out.split(" / ").collect();
        assert_eq!(parts.len(), 2);
        assert!(!parts[0].is_empty());
        assert!(!parts[1].is_empty());
    }

    #[test]
    fn hex_color_shape() {
        let out = render("{{ HexColor() }}", &ctx()).unwrap();
        assert!(out.starts_with('#'));
        assert_eq!(out.len(), 7);
    }

    #[test]
    fn password_respects_bounds() {
        let out = render("{{ Password(min=10, max=10) }}", &ctx()).unwrap();
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn year_respects_bounds() {
        let out = render("{{ Year(from=2000, to=2000) }}", &ctx()).unwrap();
        assert_eq!(out, "2000");
    }

    #[test]
    fn numeric_generators_in_range() {
        let day: i64 = render("{{ Day() }}", &ctx()).unwrap().parse().unwrap();
        assert!((1..=31).contains(&day));
        let month: i64 = render("{{ MonthNum() }}", &ctx()).unwrap().parse().unwrap();
        assert!((1..=12).contains(&month));
    }

    #[test]
    fn invalid_template_is_an_error() {
        assert!(render("{{ unclosed", &ctx()).is_err());
        assert!(render("{{ NoSuchFunction() }}", &ctx()).is_err());
    }

    #[test]
    fn lang_codes_fall_back_to_english() {
        assert_eq!(Lang::from_code("fr"), Lang::Fr);
        assert_eq!(Lang::from_code("ZH_TW"), Lang::ZhTw);
        assert_eq!(Lang::from_code("martian"), Lang::En);
        assert_eq!(Lang::from_code(""), Lang::En);
    }
}
